//! Resource names and manifests for one session's sandbox.

use serde_json::{Value, json};
use stagehand_protocol::SessionId;

use super::ClusterSettings;
use super::api::{ClusterResource, ResourceKind, SESSION_LABEL};

/// Every name derives from the session slug, so re-provisioning a session
/// finds the resources it created before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub slug: String,
    pub pod: String,
    pub volume_claim: String,
    pub service: String,
    pub tools_service: String,
    pub ingress: Option<String>,
}

impl ResourceNames {
    pub fn for_session(session_id: &SessionId, with_ingress: bool) -> Self {
        let slug = session_id.slug();
        let base = format!("stagehand-{slug}");
        Self {
            pod: base.clone(),
            volume_claim: format!("{base}-pvc"),
            service: format!("{base}-svc"),
            tools_service: format!("{base}-vscode-svc"),
            ingress: with_ingress.then(|| format!("{base}-ingress")),
            slug,
        }
    }

    /// Resources released on every teardown. The volume claim is not among them.
    pub fn compute(&self) -> Vec<(ResourceKind, &str)> {
        let mut out = vec![
            (ResourceKind::Pod, self.pod.as_str()),
            (ResourceKind::Service, self.service.as_str()),
            (ResourceKind::Service, self.tools_service.as_str()),
        ];
        if let Some(ingress) = &self.ingress {
            out.push((ResourceKind::Ingress, ingress.as_str()));
        }
        out
    }
}

/// Creation order: storage first, then the pod that mounts it, then the
/// services and ingress that route to the pod.
pub fn plan(names: &ResourceNames, settings: &ClusterSettings) -> Vec<ClusterResource> {
    let mut resources = vec![
        volume_claim(names, settings),
        pod(names, settings),
        service(names, &names.service, settings.protocol_port),
        service(names, &names.tools_service, settings.tools_port),
    ];
    if let (Some(ingress_name), Some(host)) = (&names.ingress, &settings.ingress_host) {
        resources.push(ingress(names, ingress_name, host, settings.tools_port));
    }
    resources
}

fn metadata(names: &ResourceNames, name: &str) -> Value {
    json!({
        "name": name,
        "labels": {
            "app.kubernetes.io/name": "stagehand-sandbox",
            SESSION_LABEL: names.slug,
        }
    })
}

fn volume_claim(names: &ResourceNames, settings: &ClusterSettings) -> ClusterResource {
    let mut spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": {"requests": {"storage": settings.storage_size}},
    });
    if let Some(class) = &settings.storage_class {
        spec["storageClassName"] = json!(class);
    }
    ClusterResource {
        kind: ResourceKind::PersistentVolumeClaim,
        name: names.volume_claim.clone(),
        manifest: json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": metadata(names, &names.volume_claim),
            "spec": spec,
        }),
    }
}

fn pod(names: &ResourceNames, settings: &ClusterSettings) -> ClusterResource {
    let workspace = settings.workspace_mount.display().to_string();
    ClusterResource {
        kind: ResourceKind::Pod,
        name: names.pod.clone(),
        manifest: json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": metadata(names, &names.pod),
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": "sandbox",
                    "image": settings.image,
                    "args": [
                        "--host", "0.0.0.0",
                        "--port", settings.protocol_port.to_string(),
                        "--workspace", workspace,
                    ],
                    "ports": [
                        {"name": "protocol", "containerPort": settings.protocol_port},
                        {"name": "tools", "containerPort": settings.tools_port},
                    ],
                    "resources": {
                        "requests": {"cpu": settings.cpu_request, "memory": settings.memory_request},
                    },
                    "readinessProbe": {
                        "httpGet": {"path": "/alive", "port": settings.protocol_port},
                        "periodSeconds": 2,
                    },
                    "volumeMounts": [{"name": "workspace", "mountPath": workspace}],
                }],
                "volumes": [{
                    "name": "workspace",
                    "persistentVolumeClaim": {"claimName": names.volume_claim},
                }],
            },
        }),
    }
}

fn service(names: &ResourceNames, name: &str, port: u16) -> ClusterResource {
    ClusterResource {
        kind: ResourceKind::Service,
        name: name.to_owned(),
        manifest: json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": metadata(names, name),
            "spec": {
                "selector": {SESSION_LABEL: names.slug},
                "ports": [{"port": port, "targetPort": port, "protocol": "TCP"}],
            },
        }),
    }
}

fn ingress(names: &ResourceNames, name: &str, host: &str, port: u16) -> ClusterResource {
    ClusterResource {
        kind: ResourceKind::Ingress,
        name: name.to_owned(),
        manifest: json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": metadata(names, name),
            "spec": {
                "rules": [{
                    "host": format!("{}.{host}", names.slug),
                    "http": {"paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": {"service": {
                            "name": names.tools_service,
                            "port": {"number": port},
                        }},
                    }]},
                }],
            },
        }),
    }
}
