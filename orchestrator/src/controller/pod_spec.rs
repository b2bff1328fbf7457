//! Pod construction for leaf templates
//!
//! Container-like templates get an `init` container that stages inputs, one
//! emissary-wrapped container per user container, and a `wait` container
//! that saves outputs. Resource and data templates run the executor directly
//! as `main`.

use chrono::{DateTime, Utc};
use serde_json::json;
use workflow_api::common::*;
use workflow_api::pod::{Container, EnvVar, PodSpec, Volume, VolumeMount};
use workflow_api::{ObjectMeta, OwnerReference, Pod, Resource, Template, TemplateType, Workflow};

use crate::errors::WfError;
use crate::storage::settings::Settings;

/// Executor binary name inside the executor image
pub const EXECUTOR_BINARY: &str = "argoflow";

const VAR_RUN_ARGO_VOLUME: &str = "var-run-argo";
const INPUT_ARTIFACTS_VOLUME: &str = "input-artifacts";
const STAGING_VOLUME: &str = "argo-staging";
const PLUGIN_SOCKETS_VOLUME: &str = "artifact-plugins";

/// What the controller knows about the pod it is about to create
pub struct PodRequest<'a> {
    pub wf: &'a Workflow,
    pub node_id: &'a str,
    pub node_name: &'a str,
    /// Template with every tag already substituted
    pub template: &'a Template,
    pub deadline: Option<DateTime<Utc>>,
}

/// `strategy` or `strategy/delay`, as stamped on pods
pub fn pod_gc_annotation(wf: &Workflow) -> String {
    let gc = wf.spec.pod_gc.clone().unwrap_or_default();
    match gc.delete_delay_duration.as_deref().filter(|d| !d.is_empty()) {
        Some(delay) => format!("{}/{}", gc.strategy, delay),
        None => gc.strategy.to_string(),
    }
}

/// Owner reference making the workflow the controller of a child object
pub fn workflow_owner_reference(wf: &Workflow) -> OwnerReference {
    OwnerReference {
        api_version: workflow_api::api_version(),
        kind: Workflow::KIND.to_string(),
        name: wf.name().to_string(),
        uid: wf.uid().to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn var_run_argo_mount() -> VolumeMount {
    VolumeMount {
        name: VAR_RUN_ARGO_VOLUME.to_string(),
        mount_path: VAR_RUN_ARGO_PATH.to_string(),
        ..Default::default()
    }
}

fn field_ref(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(json!({"fieldRef": {"fieldPath": path}})),
    }
}

fn executor_argv(mode: &str) -> Vec<String> {
    vec![EXECUTOR_BINARY.to_string(), "exec".to_string(), mode.to_string()]
}

struct Builder<'a> {
    settings: &'a Settings,
    req: &'a PodRequest<'a>,
    template_json: String,
}

impl Builder<'_> {
    fn executor_env(&self, container_name: &str) -> Vec<EnvVar> {
        let wf = self.req.wf;
        let mut env = vec![
            EnvVar::new(ENV_VAR_CONTAINER_NAME, container_name),
            EnvVar::new(ENV_VAR_POD_NAME, self.req.node_id),
            field_ref(ENV_VAR_POD_UID, "metadata.uid"),
            field_ref(ENV_VAR_HOST_IP, "status.hostIP"),
            field_ref(ENV_VAR_POD_IP, "status.podIP"),
            EnvVar::new(ENV_VAR_NAMESPACE, wf.namespace()),
            EnvVar::new(ENV_VAR_NODE_ID, self.req.node_id),
            EnvVar::new(ENV_VAR_WORKFLOW_NAME, wf.name()),
            EnvVar::new(ENV_VAR_WORKFLOW_UID, wf.uid()),
            EnvVar::new(ENV_VAR_TEMPLATE, self.template_json.clone()),
            EnvVar::new(
                ENV_VAR_TERMINATION_GRACE_PERIOD,
                format!("{}s", wf.spec.pod_spec_grace_period_seconds.unwrap_or(30)),
            ),
        ];
        if self.req.template.include_script_output {
            env.push(EnvVar::new(ENV_VAR_INCLUDE_SCRIPT_OUTPUT, "true"));
        }
        if let Some(deadline) = self.req.deadline {
            env.push(EnvVar::new(ENV_VAR_DEADLINE, deadline.to_rfc3339()));
        }
        if !self.req.template.artifact_plugins.is_empty() {
            env.push(EnvVar::new(
                ENV_VAR_ARTIFACT_PLUGIN_NAMES,
                self.req.template.artifact_plugins.join(","),
            ));
        }
        if let Some(repository) = &self.settings.artifact_repository {
            if let Ok(raw) = serde_json::to_string(repository) {
                env.push(EnvVar::new(ENV_VAR_DEFAULT_ARTIFACT_REPOSITORY, raw));
            }
        }
        env
    }

    fn executor_container(&self, name: &str, mode: &str) -> Container {
        Container {
            name: name.to_string(),
            image: self.settings.executor_image.clone(),
            command: executor_argv(mode),
            env: self.executor_env(name),
            volume_mounts: vec![var_run_argo_mount()],
            ..Default::default()
        }
    }

    /// User volume mounts re-rooted under `/mainctrfs` for init and wait
    fn main_fs_mounts(&self) -> Vec<VolumeMount> {
        self.req
            .template
            .volume_mounts()
            .into_iter()
            .map(|m| VolumeMount {
                mount_path: format!("{}{}", MAIN_FILESYSTEM_DIR, m.mount_path),
                ..m.clone()
            })
            .collect()
    }

    fn plugin_socket_mount(&self) -> Option<VolumeMount> {
        (!self.req.template.artifact_plugins.is_empty()).then(|| VolumeMount {
            name: PLUGIN_SOCKETS_VOLUME.to_string(),
            mount_path: ARTIFACT_PLUGIN_SOCKET_DIR.to_string(),
            ..Default::default()
        })
    }

    fn main_container(&self, user: &Container, script: Option<&str>) -> Result<Container, WfError> {
        let name = if user.name.is_empty() {
            MAIN_CONTAINER_NAME.to_string()
        } else {
            user.name.clone()
        };
        // image entrypoints are never looked up, so args alone cannot be run
        if user.command.is_empty() {
            return Err(WfError::BadRequest(format!(
                "container '{}' of template '{}' has no command",
                name, self.req.template.name
            )));
        }
        let mut argv = user.argv();
        if let Some(path) = script {
            argv.push(path.to_string());
        }
        let mut command = vec![
            format!("{}/{}", VAR_RUN_ARGO_PATH, EXECUTOR_BINARY),
            "exec".to_string(),
            "emissary".to_string(),
            "--".to_string(),
        ];
        command.extend(argv);
        let mut container = user.clone();
        container.name = name.clone();
        container.command = command;
        container.args = Vec::new();
        container.env.extend(self.executor_env(&name));
        container.volume_mounts.push(var_run_argo_mount());
        if script.is_some() {
            container.volume_mounts.push(VolumeMount {
                name: STAGING_VOLUME.to_string(),
                mount_path: EXECUTOR_STAGING_DIR.to_string(),
                ..Default::default()
            });
        }
        for artifact in &self.req.template.inputs.artifacts {
            if artifact.path.is_empty() {
                continue;
            }
            container.volume_mounts.push(VolumeMount {
                name: INPUT_ARTIFACTS_VOLUME.to_string(),
                mount_path: artifact.path.clone(),
                sub_path: artifact.name.clone(),
                read_only: false,
            });
        }
        Ok(container)
    }

    fn plugin_sidecars(&self) -> Result<Vec<Container>, WfError> {
        let mut sidecars = Vec::new();
        for name in &self.req.template.artifact_plugins {
            let plugin = self
                .settings
                .artifact_plugins
                .iter()
                .find(|p| &p.name == name)
                .ok_or_else(|| WfError::BadRequest(format!("artifact plugin '{}' is not configured", name)))?;
            let container_name = artifact_plugin_container_name(name);
            let mut command = vec![
                format!("{}/{}", VAR_RUN_ARGO_PATH, EXECUTOR_BINARY),
                "exec".to_string(),
                "artifact-plugin-sidecar".to_string(),
                "--".to_string(),
            ];
            command.extend(plugin.command.iter().cloned());
            let mut mounts = vec![var_run_argo_mount()];
            mounts.extend(self.plugin_socket_mount());
            sidecars.push(Container {
                name: container_name.clone(),
                image: plugin.image.clone(),
                command,
                env: self.executor_env(&container_name),
                volume_mounts: mounts,
                ..Default::default()
            });
        }
        Ok(sidecars)
    }

    fn containers(&self, template_type: TemplateType) -> Result<(Vec<Container>, Vec<Container>), WfError> {
        let template = self.req.template;
        match template_type {
            TemplateType::Resource | TemplateType::Data => {
                let mode = if template_type == TemplateType::Resource {
                    "resource"
                } else {
                    "data"
                };
                Ok((Vec::new(), vec![self.executor_container(MAIN_CONTAINER_NAME, mode)]))
            }
            TemplateType::Container | TemplateType::Script | TemplateType::ContainerSet => {
                let mut init = self.executor_container(INIT_CONTAINER_NAME, "init");
                init.volume_mounts.extend(self.main_fs_mounts());
                init.volume_mounts.extend(self.plugin_socket_mount());
                if !template.inputs.artifacts.is_empty() {
                    init.volume_mounts.push(VolumeMount {
                        name: INPUT_ARTIFACTS_VOLUME.to_string(),
                        mount_path: EXECUTOR_ARTIFACT_BASE_DIR.to_string(),
                        ..Default::default()
                    });
                }
                let script_path = format!("{}/{}", EXECUTOR_STAGING_DIR, EXECUTOR_SCRIPT_SOURCE_NAME);
                if template.script.is_some() {
                    init.volume_mounts.push(VolumeMount {
                        name: STAGING_VOLUME.to_string(),
                        mount_path: EXECUTOR_STAGING_DIR.to_string(),
                        ..Default::default()
                    });
                }

                let mut containers = Vec::new();
                if let Some(script) = &template.script {
                    containers.push(self.main_container(&script.container, Some(&script_path))?);
                } else {
                    for user in template.main_containers() {
                        containers.push(self.main_container(user, None)?);
                    }
                }

                let mut wait = self.executor_container(WAIT_CONTAINER_NAME, "wait");
                wait.volume_mounts.extend(self.main_fs_mounts());
                wait.volume_mounts.extend(self.plugin_socket_mount());
                containers.push(wait);
                containers.extend(template.sidecars.iter().cloned());
                containers.extend(self.plugin_sidecars()?);
                Ok((vec![init], containers))
            }
            other => Err(WfError::Internal(format!("{} templates do not run in pods", other))),
        }
    }

    fn volumes(&self) -> Vec<Volume> {
        let template = self.req.template;
        let mut volumes = vec![Volume::empty_dir(VAR_RUN_ARGO_VOLUME)];
        if !template.inputs.artifacts.is_empty() {
            volumes.push(Volume::empty_dir(INPUT_ARTIFACTS_VOLUME));
        }
        if template.script.is_some() {
            volumes.push(Volume::empty_dir(STAGING_VOLUME));
        }
        if !template.artifact_plugins.is_empty() {
            volumes.push(Volume::empty_dir(PLUGIN_SOCKETS_VOLUME));
        }
        for volume in self.req.wf.spec.volumes.iter().chain(template.volumes.iter()) {
            if !volumes.iter().any(|v| v.name == volume.name) {
                volumes.push(volume.clone());
            }
        }
        volumes
    }
}

/// Build the pod that runs `req.template` for node `req.node_id`
pub fn build_pod(settings: &Settings, req: &PodRequest<'_>) -> Result<Pod, WfError> {
    let template_type = req.template.template_type().map_err(WfError::BadRequest)?;
    let builder = Builder {
        settings,
        req,
        template_json: serde_json::to_string(req.template)?,
    };
    let (init_containers, containers) = builder.containers(template_type)?;
    let wf = req.wf;

    let mut metadata = ObjectMeta::named(wf.namespace(), req.node_id);
    if let Some(extra) = &req.template.metadata {
        metadata.labels.extend(extra.labels.clone());
        metadata.annotations.extend(extra.annotations.clone());
    }
    metadata.labels.insert(LABEL_KEY_WORKFLOW.to_string(), wf.name().to_string());
    metadata.labels.insert(LABEL_KEY_COMPLETED.to_string(), "false".to_string());
    if !settings.instance_id.is_empty() {
        metadata
            .labels
            .insert(LABEL_KEY_CONTROLLER_INSTANCE_ID.to_string(), settings.instance_id.clone());
    }
    metadata
        .annotations
        .insert(ANNOTATION_KEY_NODE_NAME.to_string(), req.node_name.to_string());
    metadata
        .annotations
        .insert(ANNOTATION_KEY_NODE_ID.to_string(), req.node_id.to_string());
    metadata
        .annotations
        .insert(ANNOTATION_KEY_TEMPLATE.to_string(), builder.template_json.clone());
    metadata
        .annotations
        .insert(ANNOTATION_KEY_POD_GC_STRATEGY.to_string(), pod_gc_annotation(wf));
    metadata.owner_references.push(workflow_owner_reference(wf));
    if settings.pod_status_capture_finalizer {
        metadata.finalizers.push(FINALIZER_POD_STATUS.to_string());
    }

    let service_account_name = req
        .template
        .service_account_name
        .clone()
        .unwrap_or_else(|| wf.spec.service_account_name.clone());

    Ok(Pod {
        api_version: "v1".to_string(),
        kind: Pod::KIND.to_string(),
        metadata,
        spec: PodSpec {
            init_containers,
            containers,
            volumes: builder.volumes(),
            restart_policy: "Never".to_string(),
            service_account_name,
            node_name: String::new(),
            termination_grace_period_seconds: wf.spec.pod_spec_grace_period_seconds,
            active_deadline_seconds: req.template.active_deadline_seconds,
        },
        status: Default::default(),
    })
}

/// Name of the pod that runs a workflow's HTTP tasks
pub fn agent_pod_name(wf: &Workflow) -> String {
    format!("{}-agent", wf.name())
}

/// Long-running pod that executes the tasks of the workflow's task set
pub fn build_agent_pod(settings: &Settings, wf: &Workflow) -> Pod {
    let name = agent_pod_name(wf);
    let mut metadata = ObjectMeta::named(wf.namespace(), &name);
    metadata.labels.insert(LABEL_KEY_WORKFLOW.to_string(), wf.name().to_string());
    metadata.labels.insert(LABEL_KEY_COMPLETED.to_string(), "false".to_string());
    if !settings.instance_id.is_empty() {
        metadata
            .labels
            .insert(LABEL_KEY_CONTROLLER_INSTANCE_ID.to_string(), settings.instance_id.clone());
    }
    metadata.owner_references.push(workflow_owner_reference(wf));

    let agent = Container {
        name: MAIN_CONTAINER_NAME.to_string(),
        image: settings.executor_image.clone(),
        command: executor_argv("agent"),
        env: vec![
            EnvVar::new(ENV_VAR_CONTAINER_NAME, MAIN_CONTAINER_NAME),
            EnvVar::new(ENV_VAR_POD_NAME, name.as_str()),
            EnvVar::new(ENV_VAR_NAMESPACE, wf.namespace()),
            EnvVar::new(ENV_VAR_WORKFLOW_NAME, wf.name()),
            EnvVar::new(ENV_VAR_WORKFLOW_UID, wf.uid()),
        ],
        ..Default::default()
    };
    Pod {
        api_version: "v1".to_string(),
        kind: Pod::KIND.to_string(),
        metadata,
        spec: PodSpec {
            containers: vec![agent],
            restart_policy: "Never".to_string(),
            service_account_name: wf.spec.service_account_name.clone(),
            ..Default::default()
        },
        status: Default::default(),
    }
}
