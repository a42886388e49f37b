//! Embedded templates - compiled into the binary so the provisioner is
//! self-contained on hosts where only the binary is shipped.

/// Startup script for the studio app.
pub static START_SERVICE: &str = include_str!("templates/start_service.sh.j2");

/// Process-supervisor configuration for the app and its API sidecar.
pub static SUPERVISOR_CONF: &str = include_str!("templates/supervisord.conf.j2");

/// All embedded templates as (name, content) pairs for registration with Tera.
pub const ALL_TEMPLATES: &[(&str, &str)] = &[
    ("start_service.sh.j2", START_SERVICE),
    ("supervisord.conf.j2", SUPERVISOR_CONF),
];
