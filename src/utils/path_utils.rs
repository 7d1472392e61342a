use crate::config::Config;
use crate::error::AppError;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Expands tilde (~) in a path string to the user's home directory.
pub fn expand_tilde_path_buf(path_str: &str) -> Result<PathBuf, AppError> {
    Ok(PathBuf::from(shellexpand::tilde(path_str).as_ref()))
}

/// Makes `path_str` absolute against `files_root` and folds `.`/`..` lexically.
/// Existing paths are canonicalized so symlinks cannot escape the root.
fn normalize_path(path_str: &str, files_root: &Path) -> Result<PathBuf, AppError> {
    let expanded_path = expand_tilde_path_buf(path_str)?;

    let absolute_path = if expanded_path.is_absolute() {
        expanded_path
    } else {
        files_root.join(expanded_path)
    };

    let mut components: Vec<Component> = Vec::new();
    for component in absolute_path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `/..` stays `/`
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
            _ => components.push(component),
        }
    }
    let lexical: PathBuf = components.iter().collect();

    match dunce::canonicalize(&lexical) {
        Ok(canonical_path) => Ok(canonical_path),
        Err(_) => Ok(lexical),
    }
}

fn is_filesystem_root(path: &Path) -> bool {
    path.is_absolute() && path.parent().is_none()
}

/// Resolves `target_path_str` and checks it lies inside `files_root` and one of the allowed directories.
pub fn validate_path_access(
    target_path_str: &str,
    config: &Config,
    check_existence: bool,
) -> Result<PathBuf, AppError> {
    debug!(target_path = %target_path_str, check_existence = %check_existence, "Validating path access");
    let normalized_target_path = normalize_path(target_path_str, &config.files_root)?;
    debug!(normalized_path = %normalized_target_path.display(), "Normalized path");

    if check_existence && !normalized_target_path.exists() {
        return Err(AppError::InvalidPath(format!(
            "Path does not exist: {}",
            normalized_target_path.display()
        )));
    }

    if !is_filesystem_root(&config.files_root) && !normalized_target_path.starts_with(&config.files_root) {
        debug!(path = %normalized_target_path.display(), root = %config.files_root.display(), "Path is outside files_root");
        return Err(AppError::PathTraversal(format!(
            "Path {} is outside of the configured root directory {}",
            normalized_target_path.display(),
            config.files_root.display()
        )));
    }

    let is_allowed = config.allowed_directories.iter().any(|allowed_dir| {
        let normalized_allowed_dir = normalize_path(&allowed_dir.to_string_lossy(), &config.files_root)
            .unwrap_or_else(|_| allowed_dir.clone());
        is_filesystem_root(&normalized_allowed_dir) || normalized_target_path.starts_with(&normalized_allowed_dir)
    });

    if !is_allowed {
        debug!(path = %normalized_target_path.display(), allowed_dirs = ?config.allowed_directories, "Path not in allowed_directories");
        return Err(AppError::PathNotAllowed(format!(
            "Path {} is not within any allowed directories. Allowed: {:?}",
            normalized_target_path.display(),
            config.allowed_directories
        )));
    }

    Ok(normalized_target_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> Config {
        Config::new(dunce::canonicalize(dir.path()).expect("canonical tempdir"))
    }

    #[cfg(unix)]
    #[test]
    fn tilde_expands_to_home_and_leaves_plain_paths_alone() {
        assert_eq!(expand_tilde_path_buf("/srv/work").unwrap(), PathBuf::from("/srv/work"));
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(expand_tilde_path_buf("~/work").unwrap(), Path::new(&home).join("work"));
        }
    }

    #[test]
    fn relative_paths_resolve_against_root() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("project")).unwrap();
        let config = config_for(&root);

        let resolved = validate_path_access("project", &config, true).unwrap();
        assert_eq!(resolved, config.files_root.join("project"));

        let resolved = validate_path_access("./project/../project", &config, true).unwrap();
        assert_eq!(resolved, config.files_root.join("project"));
    }

    #[test]
    fn missing_path_fails_only_when_existence_required() {
        let root = tempfile::tempdir().unwrap();
        let config = config_for(&root);

        let err = validate_path_access("nope", &config, true).unwrap_err();
        assert!(matches!(err, AppError::InvalidPath(_)));
        assert!(validate_path_access("nope", &config, false).is_ok());
    }

    #[test]
    fn escaping_the_root_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("inner")).unwrap();
        let config = Config::new(dunce::canonicalize(root.path().join("inner")).unwrap());

        let err = validate_path_access("..", &config, true).unwrap_err();
        assert!(matches!(err, AppError::PathTraversal(_)));
    }

    #[test]
    fn paths_outside_allowed_directories_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("open")).unwrap();
        std::fs::create_dir(root.path().join("closed")).unwrap();
        let mut config = config_for(&root);
        config.allowed_directories = vec![config.files_root.join("open")];

        assert!(validate_path_access("open", &config, true).is_ok());
        let err = validate_path_access("closed", &config, true).unwrap_err();
        assert!(matches!(err, AppError::PathNotAllowed(_)));
    }
}
