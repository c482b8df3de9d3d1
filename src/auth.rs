use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

/// Credentials for the wire front end. Every login shares one cleartext
/// password. With a role set, any other user name is refused before the
/// password is checked.
#[derive(Debug, Clone)]
pub struct FitslotAuthSource {
    role: Option<String>,
    password: Arc<[u8]>,
}

impl FitslotAuthSource {
    pub fn new(password: &str) -> Self {
        Self {
            role: None,
            password: Arc::from(password.as_bytes()),
        }
    }

    pub fn with_role(mut self, role: Option<String>) -> Self {
        self.role = role;
        self
    }

    fn admit(&self, login: &LoginInfo) -> PgWireResult<()> {
        let Some(role) = &self.role else {
            return Ok(());
        };
        let user = login.user().unwrap_or_default();
        if user == role {
            return Ok(());
        }
        tracing::warn!(user, host = login.host(), "login refused: unknown role");
        Err(PgWireError::UserError(Box::new(ErrorInfo::new(
            "FATAL".into(),
            "28000".into(),
            format!("role \"{user}\" is not permitted to log in"),
        ))))
    }
}

#[async_trait]
impl AuthSource for FitslotAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        self.admit(login)?;
        tracing::debug!(
            user = login.user().unwrap_or_default(),
            host = login.host(),
            "password requested"
        );
        Ok(Password::new(None, self.password.to_vec()))
    }
}
