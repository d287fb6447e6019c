use crate::config::ThreadlineConfig;
use crate::database::Database;
use anyhow::Result;
use std::fs;

pub struct BootstrapResources {
    pub directories_created: Vec<String>,
    pub database_initialized: bool,
    pub database: Database,
}

pub fn initialize(config: &ThreadlineConfig) -> Result<BootstrapResources> {
    let mut directories_created = Vec::new();
    create_dir_if_missing(&config.paths.data_dir, &mut directories_created)?;
    create_dir_if_missing(&config.paths.media_dir, &mut directories_created)?;
    create_dir_if_missing(&config.paths.uploads_dir, &mut directories_created)?;

    let database = Database::connect(&config.paths)?;
    let database_initialized = database.ensure_migrations()?;

    Ok(BootstrapResources {
        directories_created,
        database_initialized,
        database,
    })
}

fn create_dir_if_missing(path: &std::path::Path, created: &mut Vec<String>) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
        created.push(path.display().to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn initialize_creates_layout_once() {
        let temp = tempdir().expect("tempdir");
        let config = ThreadlineConfig::for_base_dir(temp.path(), 0).expect("config");

        let first = initialize(&config).expect("first bootstrap");
        assert!(first.database_initialized);
        assert_eq!(first.directories_created.len(), 3);
        assert!(config.paths.db_path.exists());
        drop(first);

        let second = initialize(&config).expect("second bootstrap");
        assert!(!second.database_initialized);
        assert!(second.directories_created.is_empty());
    }
}
