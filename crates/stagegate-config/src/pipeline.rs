//! Pipeline definition parsing.

use crate::variables::PipelineContext;
use crate::{ConfigError, ConfigResult, VariableContext};
use kdl::{KdlDocument, KdlNode};
use stagegate_core::gate::{BroadeningRule, GatePolicy, OnBroadening};
use stagegate_core::secret::{SecretProvider, SecretRef};
use stagegate_core::source::{BuildStep, SourceProvider, SourceSpec};
use stagegate_core::unit::{ApplicationUnit, Environment, Grant, Principal, RemovalPolicy, Resource};
use stagegate_core::{Pipeline, Plan, Stage};
use std::path::Path;
use tracing::debug;

/// Read and parse a pipeline definition file.
pub fn load_pipeline(path: impl AsRef<Path>) -> ConfigResult<Plan> {
    let content = std::fs::read_to_string(path)?;
    parse_pipeline(&content)
}

/// Parse a pipeline definition, resolving `${env.*}` against the process
/// environment.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<Plan> {
    parse_pipeline_with_context(kdl, VariableContext::from_process_env())
}

/// Parse a pipeline definition from KDL text into a validated plan.
pub fn parse_pipeline_with_context(kdl: &str, mut ctx: VariableContext) -> ConfigResult<Plan> {
    let doc: KdlDocument = kdl.parse()?;

    // The pipeline node seeds ${pipeline.*}, so it is read before anything else.
    let mut headers = doc.nodes().iter().filter(|n| n.name().value() == "pipeline");
    let header = headers
        .next()
        .ok_or_else(|| ConfigError::MissingField("pipeline".to_string()))?;
    if headers.next().is_some() {
        return Err(ConfigError::InvalidValue {
            field: "pipeline".to_string(),
            message: "declared more than once".to_string(),
        });
    }

    let name = get_first_string_arg(header)
        .map(|n| ctx.interpolate(&n))
        .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
    let account = get_resolved_prop(header, "account", &ctx)?
        .ok_or_else(|| ConfigError::MissingField("pipeline account".to_string()))?;
    let region = get_resolved_prop(header, "region", &ctx)?
        .ok_or_else(|| ConfigError::MissingField("pipeline region".to_string()))?;

    ctx.pipeline = PipelineContext {
        name: name.clone(),
        account: account.clone(),
        region: region.clone(),
    };
    let env = Environment::new(account, region);

    let mut source = None;
    let mut build = None;
    let mut stages = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "source" => source = Some(parse_source(node, &ctx)?),
            "build" => build = Some(parse_build(node, &ctx)?),
            "stage" => stages.push(parse_stage(node, &ctx, &env)?),
            _ => {} // Ignore unknown nodes
        }
    }

    let source = source.ok_or_else(|| ConfigError::MissingField("source".to_string()))?;
    let build = build.ok_or_else(|| ConfigError::MissingField("build".to_string()))?;

    let mut pipeline = Pipeline::new(name, env, source, build);
    for stage in stages {
        pipeline.add_stage(stage)?;
    }
    let plan = pipeline.into_plan()?;

    debug!(
        pipeline = %plan.name(),
        stages = plan.pipeline().stages.len(),
        warnings = plan.warnings().len(),
        "Parsed pipeline definition"
    );

    Ok(plan)
}

fn parse_source(node: &KdlNode, ctx: &VariableContext) -> ConfigResult<SourceSpec> {
    let provider = get_first_string_arg(node).unwrap_or_else(|| "github".to_string());
    let provider: SourceProvider = provider.parse().map_err(|message| ConfigError::InvalidValue {
        field: "source provider".to_string(),
        message,
    })?;

    let owner = get_string_prop(node, "owner", ctx)
        .ok_or_else(|| ConfigError::MissingField("source owner".to_string()))?;
    let repo = get_string_prop(node, "repo", ctx)
        .ok_or_else(|| ConfigError::MissingField("source repo".to_string()))?;
    let branch = get_string_prop(node, "branch", ctx).unwrap_or_else(|| "main".to_string());

    let token = find_child(node, "token")
        .map(|t| parse_token(t, ctx))
        .transpose()?
        .ok_or_else(|| ConfigError::MissingField("source token".to_string()))?;

    Ok(SourceSpec {
        provider,
        owner,
        repo,
        branch,
        token,
    })
}

/// `token secrets-manager="name"`, `token env="VAR"`, or the long form
/// `token provider="secrets-manager" name="name"`, each with an optional `key`.
fn parse_token(node: &KdlNode, ctx: &VariableContext) -> ConfigResult<SecretRef> {
    let (provider, name) = match get_string_prop(node, "provider", ctx) {
        Some(provider) => {
            let name = get_string_prop(node, "name", ctx)
                .ok_or_else(|| ConfigError::MissingField("source token name".to_string()))?;
            (provider, name)
        }
        None => ["secrets-manager", "env"]
            .iter()
            .find_map(|p| get_string_prop(node, p, ctx).map(|name| (p.to_string(), name)))
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "source token".to_string(),
                message: "expected secrets-manager=\"...\" or env=\"...\"".to_string(),
            })?,
    };

    let provider: SecretProvider =
        provider
            .parse()
            .map_err(|message| ConfigError::InvalidValue {
                field: "source token provider".to_string(),
                message,
            })?;

    Ok(SecretRef {
        provider,
        name,
        key: get_string_prop(node, "key", ctx),
    })
}

fn parse_build(node: &KdlNode, ctx: &VariableContext) -> ConfigResult<BuildStep> {
    let preset = get_first_string_arg(node).unwrap_or_else(|| "yarn".to_string());
    let child = |name: &str| find_child(node, name).and_then(|c| get_string_arg(c, ctx));

    let mut step = match preset.as_str() {
        "yarn" => BuildStep::yarn(child("build")),
        "npm" => BuildStep::npm(child("build")),
        "custom" => {
            let synth = child("synth")
                .ok_or_else(|| ConfigError::MissingField("build synth".to_string()))?;
            let mut step = BuildStep::new(synth);
            step.build_command = child("build");
            step
        }
        _ => {
            return Err(ConfigError::InvalidValue {
                field: "build preset".to_string(),
                message: format!("unknown build preset: {}", preset),
            });
        }
    };

    if let Some(install) = child("install") {
        step.install_command = Some(install);
    }
    if let Some(synth) = child("synth") {
        step.synth_command = synth;
    }
    if let Some(artifact) = child("artifact") {
        step.artifact = artifact;
    }

    Ok(step)
}

fn parse_stage(node: &KdlNode, ctx: &VariableContext, env: &Environment) -> ConfigResult<Stage> {
    let name = get_string_arg(node, ctx)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;

    let mut stage = Stage::new(name);
    let mut gated = false;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "gate" => {
                    // A stage file declaring two gates is a conflict, not an override.
                    if gated {
                        return Err(ConfigError::ConflictingGate(stage.name.clone()));
                    }
                    stage.set_gate(parse_gate(child, ctx)?);
                    gated = true;
                }
                "unit" => {
                    stage.add_application(parse_unit(child, ctx, env)?)?;
                }
                _ => {}
            }
        }
    }

    Ok(stage)
}

fn parse_gate(node: &KdlNode, ctx: &VariableContext) -> ConfigResult<GatePolicy> {
    let kind = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("gate kind".to_string()))?;

    match kind.as_str() {
        "none" => Ok(GatePolicy::None),
        "manual" => Ok(GatePolicy::ManualApproval {
            comment: get_string_prop(node, "comment", ctx),
        }),
        "security-diff" => {
            let defaults = BroadeningRule::default();
            let rule = BroadeningRule {
                wildcard_principal: get_flag_prop(node, "wildcard-principal")?
                    .unwrap_or(defaults.wildcard_principal),
                wildcard_actions: get_flag_prop(node, "wildcard-actions")?
                    .unwrap_or(defaults.wildcard_actions),
                cross_account: get_flag_prop(node, "cross-account")?
                    .unwrap_or(defaults.cross_account),
                trusted_accounts: collect_child_args(node, "trusted-account", ctx),
            };
            let on_broadening = match get_string_prop(node, "on-broadening", ctx) {
                Some(value) => value.parse().map_err(|message| ConfigError::InvalidValue {
                    field: "on-broadening".to_string(),
                    message,
                })?,
                None => OnBroadening::default(),
            };
            Ok(GatePolicy::SecurityDiff {
                rule,
                on_broadening,
                notify: collect_child_args(node, "notify", ctx),
            })
        }
        _ => Err(ConfigError::InvalidValue {
            field: "gate kind".to_string(),
            message: format!("unknown gate kind: {}", kind),
        }),
    }
}

fn parse_unit(
    node: &KdlNode,
    ctx: &VariableContext,
    pipeline_env: &Environment,
) -> ConfigResult<ApplicationUnit> {
    let name = get_string_arg(node, ctx)
        .ok_or_else(|| ConfigError::MissingField("unit name".to_string()))?;

    // Units default to the pipeline's own account and region.
    let env = Environment::new(
        get_resolved_prop(node, "account", ctx)?.unwrap_or_else(|| pipeline_env.account.clone()),
        get_resolved_prop(node, "region", ctx)?.unwrap_or_else(|| pipeline_env.region.clone()),
    );

    let mut resources = Vec::new();
    let mut commands = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "resource" => resources.push(parse_resource(child, ctx)?),
                "run" => {
                    if let Some(cmd) = get_string_arg(child, ctx) {
                        commands.push(cmd);
                    }
                }
                _ => {}
            }
        }
    }

    let kind = get_first_string_prop(node, "kind").unwrap_or_else(|| "stack".to_string());
    let unit = match kind.as_str() {
        "stack" => {
            if !commands.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("unit '{}'", name),
                    message: "run commands are only valid for script units".to_string(),
                });
            }
            ApplicationUnit::stack(name, env)
        }
        "script" => {
            if !resources.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("unit '{}'", name),
                    message: "script units cannot declare resources".to_string(),
                });
            }
            if commands.is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "run commands for script unit '{}'",
                    name
                )));
            }
            ApplicationUnit::script(name, env, commands)
        }
        _ => {
            return Err(ConfigError::InvalidValue {
                field: format!("kind of unit '{}'", name),
                message: format!("unknown unit kind: {}", kind),
            });
        }
    };

    Ok(resources
        .into_iter()
        .fold(unit, |unit, resource| unit.with_resource(resource)))
}

fn parse_resource(node: &KdlNode, ctx: &VariableContext) -> ConfigResult<Resource> {
    let id = get_string_arg(node, ctx)
        .ok_or_else(|| ConfigError::MissingField("resource id".to_string()))?;
    let kind = get_string_prop(node, "kind", ctx)
        .ok_or_else(|| ConfigError::MissingField(format!("kind for resource '{}'", id)))?;

    let mut resource = Resource::new(id, kind);

    if let Some(removal) = get_string_prop(node, "removal", ctx) {
        resource.removal =
            removal
                .parse::<RemovalPolicy>()
                .map_err(|message| ConfigError::InvalidValue {
                    field: format!("removal for resource '{}'", resource.id),
                    message,
                })?;
    }
    resource.auto_delete_objects = get_flag_prop(node, "auto-delete-objects")?.unwrap_or(false);

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "grant" {
                resource.grants.push(parse_grant(child, ctx, &resource.id)?);
            }
        }
    }

    Ok(resource)
}

fn parse_grant(node: &KdlNode, ctx: &VariableContext, resource: &str) -> ConfigResult<Grant> {
    let principal = get_string_prop(node, "principal", ctx)
        .ok_or_else(|| ConfigError::MissingField(format!("principal for grant on '{}'", resource)))?;
    let principal: Principal = principal.parse().map_err(|message| ConfigError::InvalidValue {
        field: format!("principal for grant on '{}'", resource),
        message,
    })?;

    let actions: Vec<String> = get_string_list_prop(node, "actions")
        .iter()
        .map(|a| ctx.interpolate(a))
        .collect();
    if actions.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "actions for grant on '{}'",
            resource
        )));
    }

    Ok(Grant::new(principal, actions))
}

// Helper functions for extracting values from KDL nodes

fn find_child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()
        .and_then(|c| c.nodes().iter().find(|n| n.name().value() == name))
}

fn collect_child_args(node: &KdlNode, name: &str, ctx: &VariableContext) -> Vec<String> {
    node.children()
        .map(|c| {
            c.nodes()
                .iter()
                .filter(|n| n.name().value() == name)
                .flat_map(get_all_string_args)
                .map(|v| ctx.interpolate(&v))
                .collect()
        })
        .unwrap_or_default()
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_string_arg(node: &KdlNode, ctx: &VariableContext) -> Option<String> {
    get_first_string_arg(node).map(|s| ctx.interpolate(&s))
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_first_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str, ctx: &VariableContext) -> Option<String> {
    get_first_string_prop(node, name).map(|s| ctx.interpolate(&s))
}

/// Like [`get_string_prop`], but every variable must resolve.
fn get_resolved_prop(
    node: &KdlNode,
    name: &str,
    ctx: &VariableContext,
) -> ConfigResult<Option<String>> {
    let Some(raw) = get_first_string_prop(node, name) else {
        return Ok(None);
    };
    let unresolved = ctx.unresolved(&raw);
    if !unresolved.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("unresolved variable(s): {}", unresolved.join(", ")),
        });
    }
    Ok(Some(ctx.interpolate(&raw)))
}

/// Accepts KDL booleans as well as `"true"` / `"false"` strings.
fn get_flag_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<bool>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    if let Some(b) = value.as_bool() {
        return Ok(Some(b));
    }
    match value.as_string() {
        Some("true") => Ok(Some(true)),
        Some("false") => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            field: name.to_string(),
            message: "expected true or false".to_string(),
        }),
    }
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated attributes: actions="a" actions="b"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax: actions "a" "b"
    if let Some(child) = find_child(node, name) {
        return get_all_string_args(child);
    }

    Vec::new()
}
