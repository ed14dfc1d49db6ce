use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// One shared password for every user and tenant.
#[derive(Debug)]
pub struct MilkrunAuthSource {
    password: String,
}

impl MilkrunAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for MilkrunAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(user = ?login.user(), database = ?login.database(), "password login");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
