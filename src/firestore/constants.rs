pub(crate) const DEFAULT_DATABASE_ID: &str = "(default)";
pub(crate) const DEFAULT_HOST: &str = "firestore.googleapis.com";
