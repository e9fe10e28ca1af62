use super::{DispatchError, Workpackage};
use crate::parameters::reference;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::trace;

/// name of the rendered job script inside an execution directory
pub const JOB_SCRIPT: &str = "job.sh";
/// name of the parameter dump inside an execution directory
pub const PARAMETER_DUMP: &str = "parameters.yaml";

/// Fill `$name` references of a template with workpackage parameters.
/// Unknown references are kept as written.
pub fn render(template: &str, workpackage: &Workpackage) -> String {
    let rendered = reference::substitute(template, |name| {
        workpackage.get(name).map(str::to_owned)
    });

    reference::unescape(&rendered)
}

/// Create the execution directory with its job script and parameter dump.
/// Returns the path of the job script.
pub fn materialize(
    exec_dir: &Path,
    template: &Path,
    workpackage: &Workpackage,
) -> Result<PathBuf, DispatchError> {
    let source = fs::read_to_string(template).map_err(|source| DispatchError::Template {
        path: template.to_owned(),
        source,
    })?;
    let exec_dir_error = |source| DispatchError::ExecDir {
        path: exec_dir.to_owned(),
        source,
    };

    fs::create_dir_all(exec_dir).map_err(exec_dir_error)?;

    let script = exec_dir.join(JOB_SCRIPT);
    fs::write(&script, render(&source, workpackage)).map_err(exec_dir_error)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))
            .map_err(exec_dir_error)?;
    }

    let dump = workpackage
        .parameters
        .iter()
        .cloned()
        .collect::<BTreeMap<_, _>>();
    fs::write(exec_dir.join(PARAMETER_DUMP), serde_yaml::to_string(&dump)?)
        .map_err(exec_dir_error)?;

    trace!(exec_dir = ?exec_dir, "Materialized workpackage");

    Ok(script)
}
