//! Handlebars templates for every file this tool generates.
//!
//! Templates are compiled into the binary so a provisioning run never
//! depends on files next to the executable.

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::Result;

/// Cloud-init user-data script.
pub const CLOUD_INIT: &str = "cloud-init";
/// Default Nginx site installed on new VMs.
pub const NGINX_DEFAULT: &str = "nginx-default";
/// Reverse proxy site installed on a bastion.
pub const NGINX_PROXY: &str = "nginx-proxy";
/// Makefile installed by the `app` role.
pub const MAKEFILE: &str = "makefile";
/// Supervisor program template installed by the `app` role.
pub const SUPERVISOR: &str = "supervisor";

const SOURCES: &[(&str, &str)] = &[
    (CLOUD_INIT, include_str!("../templates/cloud-init.sh.hbs")),
    (NGINX_DEFAULT, include_str!("../templates/nginx-default.conf.hbs")),
    (NGINX_PROXY, include_str!("../templates/nginx-proxy.conf.hbs")),
    (MAKEFILE, include_str!("../templates/Makefile.hbs")),
    (SUPERVISOR, include_str!("../templates/supervisor.conf.hbs")),
];

/// Registry of the embedded templates.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

impl TemplateEngine {
    /// Compile all embedded templates.
    ///
    /// # Errors
    /// Returns [`crate::ProvisionError::Template`] if a template fails to parse.
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();

        // Output is shell, nginx and make syntax, never HTML.
        handlebars.register_escape_fn(handlebars::no_escape);
        // A missing field is a bug in the context struct, not a blank.
        handlebars.set_strict_mode(true);

        for (name, source) in SOURCES {
            handlebars.register_template_string(name, source)?;
            tracing::debug!("Registered template: {name}");
        }

        Ok(Self { handlebars })
    }

    /// Render a registered template.
    ///
    /// # Errors
    /// Returns [`crate::ProvisionError::Template`] if rendering fails.
    pub fn render<T: Serialize>(&self, name: &str, context: &T) -> Result<String> {
        Ok(self.handlebars.render(name, context)?)
    }
}

/// Quote a value for safe interpolation into a POSIX shell command.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
