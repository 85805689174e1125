use crate::installations::error::{missing_app_config_value, InstallationsResult};

/// Identifies the app whose installation is managed and the credentials used
/// to contact the installations REST API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub app_name: String,
    pub api_key: String,
    pub project_id: String,
    pub app_id: String,
}

impl AppConfig {
    pub fn new(
        app_name: impl Into<String>,
        api_key: impl Into<String>,
        project_id: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            api_key: api_key.into(),
            project_id: project_id.into(),
            app_id: app_id.into(),
        }
    }

    /// Fails with `missing-app-config-values` naming the first empty value.
    pub fn validate(&self) -> InstallationsResult<()> {
        let values = [
            ("App Name", &self.app_name),
            ("projectId", &self.project_id),
            ("apiKey", &self.api_key),
            ("appId", &self.app_id),
        ];
        match values.iter().find(|(_, value)| value.is_empty()) {
            Some((name, _)) => Err(missing_app_config_value(name)),
            None => Ok(()),
        }
    }
}
