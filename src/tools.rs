//! Command templates for the tools installed on the nodes.
//!
//! Every command the engine sends that invokes a node-local tool is rendered from a handlebars
//! template, so installations with different binaries or wrappers only change the inventory.

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};

use crate::job::DependentKind;

/// Template sources as written in the inventory's `tools` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolTemplates {
    pub replicate: String,
    pub policy_reload: String,
    pub descriptor_path: String,
    pub register: String,
    pub unregister: String,
}

impl Default for ToolTemplates {
    fn default() -> Self {
        Self {
            replicate: concat!(
                "syncoid",
                "{{#if recursive}} --recursive{{/if}}",
                " --compress={{compress}}",
                "{{#if mbuffer_size}} --mbuffer-size={{mbuffer_size}}{{/if}}",
                "{{#if no_sync_snap}} --no-sync-snap{{/if}}",
                "{{#if force_delete}} --force-delete{{/if}}",
                "{{#if ssh_key}} --sshkey={{ssh_key}}{{/if}}",
                "{{#if ssh_port}} --sshport={{ssh_port}}{{/if}}",
                " {{source}} {{target}} 2>&1",
            )
            .to_string(),
            policy_reload: "sanoid --configdir=\"$(dirname {{config_path}})\" --readonly --quiet"
                .to_string(),
            descriptor_path: concat!(
                "/etc/pve/",
                "{{#if (eq kind \"lxc\")}}lxc{{else}}qemu-server{{/if}}",
                "/{{id}}.conf",
            )
            .to_string(),
            register: concat!(
                "mv {{staged}} {{descriptor}}",
                " && {{#if (eq kind \"lxc\")}}pct{{else}}qm{{/if}} status {{id}}",
            )
            .to_string(),
            unregister: "rm -f {{descriptor}}".to_string(),
        }
    }
}

/// Parameters of one replication command.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicateParams<'a> {
    pub recursive: bool,
    pub compress: &'a str,
    pub mbuffer_size: Option<&'a str>,
    pub no_sync_snap: bool,
    pub force_delete: bool,
    pub ssh_key: Option<&'a str>,
    /// Only set when the destination does not listen on 22.
    pub ssh_port: Option<u16>,
    pub source: &'a str,
    pub target: &'a str,
}

#[derive(Serialize)]
struct DescriptorParams<'a> {
    kind: &'a str,
    id: u32,
}

#[derive(Serialize)]
struct RegisterParams<'a> {
    kind: &'a str,
    id: u32,
    descriptor: &'a str,
    staged: &'a str,
}

#[derive(Serialize)]
struct ReloadParams<'a> {
    config_path: &'a str,
}

/// Compiled templates.
pub struct Tools {
    registry: Handlebars<'static>,
}

impl Tools {
    pub fn new(templates: &ToolTemplates) -> Result<Self, handlebars::TemplateError> {
        let mut registry = Handlebars::new();
        // Commands are shell text, not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(true);
        registry.register_template_string("replicate", &templates.replicate)?;
        registry.register_template_string("policy_reload", &templates.policy_reload)?;
        registry.register_template_string("descriptor_path", &templates.descriptor_path)?;
        registry.register_template_string("register", &templates.register)?;
        registry.register_template_string("unregister", &templates.unregister)?;
        Ok(Self { registry })
    }

    pub fn replicate(&self, params: &ReplicateParams) -> Result<String, handlebars::RenderError> {
        self.registry.render("replicate", params)
    }

    pub fn policy_reload(&self, config_path: &str) -> Result<String, handlebars::RenderError> {
        self.registry
            .render("policy_reload", &ReloadParams { config_path })
    }

    pub fn descriptor_path(
        &self,
        kind: DependentKind,
        id: u32,
    ) -> Result<String, handlebars::RenderError> {
        self.registry.render(
            "descriptor_path",
            &DescriptorParams {
                kind: kind.as_str(),
                id,
            },
        )
    }

    pub fn register(
        &self,
        kind: DependentKind,
        id: u32,
        descriptor: &str,
        staged: &str,
    ) -> Result<String, handlebars::RenderError> {
        self.registry.render(
            "register",
            &RegisterParams {
                kind: kind.as_str(),
                id,
                descriptor,
                staged,
            },
        )
    }

    pub fn unregister(&self, descriptor: &str) -> Result<String, handlebars::RenderError> {
        #[derive(Serialize)]
        struct Params<'a> {
            descriptor: &'a str,
        }
        self.registry.render("unregister", &Params { descriptor })
    }
}
