#[cfg(feature = "rusqlite")]
pub mod sqlite;

use crate::campaign::CampaignReport;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[cfg(feature = "rusqlite")]
    #[error("SQLite error: {0}")]
    SQLite(rusqlite::Error),
    #[error("Failed to serialize for storage: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Built without database support")]
    Disabled,
}

/// Store a finished campaign, returns the id of the new campaign entry
pub fn store_report(
    path: &Path,
    report: &CampaignReport,
    comment: Option<&str>,
) -> Result<i64, ConnectionError> {
    #[cfg(feature = "rusqlite")]
    {
        let mut connection = sqlite::SharedConnection::load(path)?;
        connection.init()?;
        let id = connection.store(report, comment)?;
        connection.close()?;

        Ok(id)
    }

    #[cfg(not(feature = "rusqlite"))]
    {
        let _ = (path, report, comment);

        Err(ConnectionError::Disabled)
    }
}
