//! Host identity helpers

use std::io;

/// Name of the compute server this node runs on
///
/// `override_name` wins when set (the daemon passes `OS_VM_NAME`), otherwise
/// the kernel hostname is used.
pub fn resolve_hostname(override_name: Option<&str>) -> io::Result<String> {
    if let Some(name) = override_name.filter(|n| !n.is_empty()) {
        return Ok(name.to_string());
    }

    nix::unistd::gethostname()
        .map_err(io::Error::from)?
        .into_string()
        .map_err(|raw| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("hostname is not valid UTF-8: {:?}", raw),
            )
        })
}
