//! Who is calling, resolved once per request by the host application

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationContext {
    pub user_id: String,
    pub is_admin: bool,
}

impl AuthorizationContext {
    pub fn user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            is_admin: false,
        }
    }
    pub fn admin(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            is_admin: true,
        }
    }
    pub fn is_authenticated(&self) -> bool {
        !self.user_id.trim().is_empty()
    }
}
