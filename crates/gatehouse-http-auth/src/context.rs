use gatehouse_store::Application;

/// What the gateway knows about the target of a request
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    pub subdomain: String,
    pub app_id: Option<String>,
    pub org_id: Option<String>,
    pub application: Option<Application>,
    /// The subdomain belongs to a stored application
    pub is_persistent_app: bool,
}

impl AuthContext {
    /// Context for a subdomain with no stored application
    pub fn ephemeral(subdomain: impl Into<String>) -> Self {
        Self {
            subdomain: subdomain.into(),
            app_id: None,
            org_id: None,
            application: None,
            is_persistent_app: false,
        }
    }

    pub fn for_application(app: Application) -> Self {
        Self {
            subdomain: app.subdomain.clone(),
            app_id: Some(app.id.clone()),
            org_id: Some(app.org_id.clone()),
            application: Some(app),
            is_persistent_app: true,
        }
    }
}
