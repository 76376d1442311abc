use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "CardioGuard";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the application data directory
/// ~/CardioGuard/ on all platforms (user-visible, keeps records inspectable)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join("CardioGuard")
}

/// Path of the persisted emergency contacts record.
pub fn contacts_path() -> PathBuf {
    app_data_dir().join("contacts.json")
}

/// Path of the persisted patient profile record.
pub fn patient_path() -> PathBuf {
    app_data_dir().join("patient.json")
}

/// Path of the persisted emergency settings record.
pub fn settings_path() -> PathBuf {
    app_data_dir().join("settings.json")
}

/// Default tracing filter when RUST_LOG is not set.
pub fn default_log_filter() -> String {
    "info,cardioguard=debug".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_under_home() {
        let dir = app_data_dir();
        let home = dirs::home_dir().unwrap();
        assert!(dir.starts_with(home));
        assert!(dir.ends_with("CardioGuard"));
    }

    #[test]
    fn record_paths_under_app_data() {
        for path in [contacts_path(), patient_path(), settings_path()] {
            assert!(path.starts_with(app_data_dir()));
            assert_eq!(path.extension().unwrap(), "json");
        }
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, env!("CARGO_PKG_VERSION"));
    }
}
