//! Library search path setup for the bundled codec and accelerator runtimes.
//!
//! Runs at most once per process. Known install locations under the
//! third-party root are prepended to the dynamic loader path, and the VAAPI
//! driver directory is exported unless the deployment already set one.

use once_cell::sync::OnceCell;
use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";
pub const DRIVER_PATH_VAR: &str = "LIBVA_DRIVERS_PATH";
pub const THIRD_PARTY_DIR_VAR: &str = "CAMDECODE_THIRD_PARTY_DIR";

/// Where the codec framework and accelerator runtime live under a root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryLayout {
    pub codec_lib: PathBuf,
    pub accel_lib: PathBuf,
    pub driver_dir: PathBuf,
}

impl LibraryLayout {
    pub fn under(root: &Path) -> Self {
        let arch = env::consts::ARCH;
        let accel_lib = root.join("vaapi").join("linux").join(arch).join("lib");
        Self {
            codec_lib: root.join("ffmpeg").join("linux").join(arch).join("lib"),
            driver_dir: accel_lib.join("dri"),
            accel_lib,
        }
    }
}

/// Environment changes to make, computed without touching the environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapPlan {
    /// New loader path, when anything has to be added
    pub library_path: Option<OsString>,
    pub library_paths_added: Vec<PathBuf>,
    pub driver_path: Option<PathBuf>,
}

/// What the one-time bootstrap did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub root: Option<PathBuf>,
    pub library_paths_added: Vec<PathBuf>,
    pub driver_path: Option<PathBuf>,
}

static BOOTSTRAP: OnceCell<BootstrapReport> = OnceCell::new();

/// Configure search paths from the default root. Idempotent.
pub fn ensure_library_paths_configured() -> &'static BootstrapReport {
    BOOTSTRAP.get_or_init(|| configure(default_root()))
}

/// Configure search paths from an explicit root.
///
/// The first configuration in the process wins; later calls return it.
pub fn ensure_library_paths_configured_at(root: &Path) -> &'static BootstrapReport {
    BOOTSTRAP.get_or_init(|| configure(Some(root.to_path_buf())))
}

/// `CAMDECODE_THIRD_PARTY_DIR`, else `third_party/` next to the executable
pub fn default_root() -> Option<PathBuf> {
    if let Some(dir) = env::var_os(THIRD_PARTY_DIR_VAR) {
        return Some(PathBuf::from(dir));
    }
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("third_party")))
}

fn configure(root: Option<PathBuf>) -> BootstrapReport {
    let Some(root) = root.filter(|root| root.is_dir()) else {
        log::debug!("Third party directory not found, using system libraries");
        return BootstrapReport::default();
    };

    let layout = LibraryLayout::under(&root);
    let plan = plan(
        &layout,
        env::var_os(LIBRARY_PATH_VAR).as_deref(),
        env::var_os(DRIVER_PATH_VAR).as_deref(),
    );

    if let Some(library_path) = &plan.library_path {
        // SAFETY: runs once under the OnceCell guard, before this crate starts
        // any probe or decoder thread that could read the environment.
        unsafe { env::set_var(LIBRARY_PATH_VAR, library_path) };
        for path in &plan.library_paths_added {
            log::info!("Added library path: {}", path.display());
        }
    }

    if let Some(driver_path) = &plan.driver_path {
        // SAFETY: see above.
        unsafe { env::set_var(DRIVER_PATH_VAR, driver_path) };
        log::info!("Set VAAPI driver path: {}", driver_path.display());
    }

    BootstrapReport {
        root: Some(root),
        library_paths_added: plan.library_paths_added,
        driver_path: plan.driver_path,
    }
}

/// Work out the environment changes for `layout` given the current values
pub fn plan(
    layout: &LibraryLayout,
    current_library_path: Option<&OsStr>,
    current_driver_path: Option<&OsStr>,
) -> BootstrapPlan {
    let candidates: Vec<PathBuf> = [&layout.codec_lib, &layout.accel_lib]
        .into_iter()
        .filter(|path| path.is_dir())
        .cloned()
        .collect();

    let (library_path, library_paths_added) =
        match prepend_search_paths(current_library_path, &candidates) {
            Some((merged, added)) => (Some(merged), added),
            None => (None, Vec::new()),
        };

    let driver_path = match current_driver_path {
        Some(existing) if !existing.is_empty() => {
            log::debug!("{} already set to {:?}, leaving it", DRIVER_PATH_VAR, existing);
            None
        }
        _ => layout.driver_dir.is_dir().then(|| layout.driver_dir.clone()),
    };

    BootstrapPlan {
        library_path,
        library_paths_added,
        driver_path,
    }
}

/// Prepend `additions` to a search path, skipping entries already present.
///
/// Existing entries keep their order. Returns `None` when nothing changes.
pub fn prepend_search_paths(
    current: Option<&OsStr>,
    additions: &[PathBuf],
) -> Option<(OsString, Vec<PathBuf>)> {
    let existing: Vec<PathBuf> = current
        .map(|value| env::split_paths(value).filter(|p| !p.as_os_str().is_empty()).collect())
        .unwrap_or_default();

    let mut added: Vec<PathBuf> = Vec::new();
    for path in additions {
        if !existing.contains(path) && !added.contains(path) {
            added.push(path.clone());
        }
    }
    if added.is_empty() {
        return None;
    }

    match env::join_paths(added.iter().chain(existing.iter())) {
        Ok(merged) => Some((merged, added)),
        Err(e) => {
            log::warn!("Cannot extend {}: {}", LIBRARY_PATH_VAR, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_layout(root: &Path, with_driver: bool) -> LibraryLayout {
        let layout = LibraryLayout::under(root);
        std::fs::create_dir_all(&layout.codec_lib).unwrap();
        std::fs::create_dir_all(&layout.accel_lib).unwrap();
        if with_driver {
            std::fs::create_dir_all(&layout.driver_dir).unwrap();
        }
        layout
    }

    #[test]
    fn test_prepend_into_empty_path() {
        let additions = vec![PathBuf::from("/opt/a/lib"), PathBuf::from("/opt/b/lib")];
        let (merged, added) = prepend_search_paths(None, &additions).unwrap();
        assert_eq!(added, additions);
        let entries: Vec<PathBuf> = env::split_paths(&merged).collect();
        assert_eq!(entries, additions);
    }

    #[test]
    fn test_prepend_keeps_existing_order_and_skips_duplicates() {
        let current = OsString::from("/usr/lib:/opt/a/lib:/lib");
        let additions = vec![PathBuf::from("/opt/a/lib"), PathBuf::from("/opt/b/lib")];
        let (merged, added) = prepend_search_paths(Some(&current), &additions).unwrap();

        assert_eq!(added, vec![PathBuf::from("/opt/b/lib")]);
        let entries: Vec<PathBuf> = env::split_paths(&merged).collect();
        assert_eq!(
            entries,
            vec![
                PathBuf::from("/opt/b/lib"),
                PathBuf::from("/usr/lib"),
                PathBuf::from("/opt/a/lib"),
                PathBuf::from("/lib"),
            ]
        );
    }

    #[test]
    fn test_prepend_is_noop_when_already_present() {
        let current = OsString::from("/opt/a/lib:/usr/lib");
        let additions = vec![PathBuf::from("/opt/a/lib")];
        assert!(prepend_search_paths(Some(&current), &additions).is_none());
    }

    #[test]
    fn test_plan_for_full_layout() {
        let dir = tempdir().unwrap();
        let layout = make_layout(dir.path(), true);

        let plan = plan(&layout, None, None);
        assert_eq!(
            plan.library_paths_added,
            vec![layout.codec_lib.clone(), layout.accel_lib.clone()]
        );
        assert_eq!(plan.driver_path, Some(layout.driver_dir.clone()));

        // Applying the plan and planning again changes nothing
        let again = super::plan(&layout, plan.library_path.as_deref(), Some(OsStr::new("x")));
        assert_eq!(again, BootstrapPlan::default());
    }

    #[test]
    fn test_plan_respects_deployment_driver_path() {
        let dir = tempdir().unwrap();
        let layout = make_layout(dir.path(), true);

        let plan = plan(&layout, None, Some(OsStr::new("/usr/lib/dri")));
        assert!(plan.driver_path.is_none());
        assert_eq!(plan.library_paths_added.len(), 2);
    }

    #[test]
    fn test_plan_skips_missing_directories() {
        let dir = tempdir().unwrap();
        let layout = LibraryLayout::under(dir.path());
        std::fs::create_dir_all(&layout.accel_lib).unwrap();

        let plan = plan(&layout, None, None);
        assert_eq!(plan.library_paths_added, vec![layout.accel_lib.clone()]);
        assert!(plan.driver_path.is_none());
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let first = ensure_library_paths_configured() as *const BootstrapReport;
        let second = ensure_library_paths_configured() as *const BootstrapReport;
        assert_eq!(first, second);
    }
}
