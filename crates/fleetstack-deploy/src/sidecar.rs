//! Sidecar/credential provisioner for Cloud SQL consumers
//!
//! A workload reaches a shared Cloud SQL instance through the Cloud SQL Auth
//! Proxy. For every consumer this module:
//!
//! 1. obtains a password scoped to (instance, consumer identity, environment),
//!    held by the engine so redeploys keep it
//! 2. creates a proxy service account with `roles/cloudsql.client` and a key
//! 3. registers a pre-processor adding the proxy sidecar (Kubernetes) or the
//!    managed Cloud SQL volume (Cloud Run)
//! 4. registers a post-processor running a one-shot init job that creates the
//!    consumer's role and database through a throwaway proxy
//!
//! ```text
//! ┌─────────── pod ───────────┐        ┌─────────── init job ─────────────┐
//! │ app ──► 127.0.0.1:5432+n  │        │ psql ──► proxy (timeout ceiling) │
//! │         cloud-sql-proxy ──┼──┐     └──────────────────┬───────────────┘
//! └───────────────────────────┘  └──► Cloud SQL ◄─────────┘
//! ```

use crate::context::ProvisionContext;
use crate::registry::ProcessParams;
use crate::resources::EnvWriter;
use fleetstack_cloud::{Attributes, ResourceRequest, RANDOM_PASSWORD_KIND};
use fleetstack_core::{
    consumer_identity, ComputeContextCollector, ConsumedResource, ContainerSpec, Deferred, JobSpec,
    NameRules, ResourceHandle, Result, ShapeKind, StackDescriptor, StackError, VolumeMount,
    VolumeSource, VolumeSpec, WorkloadShape,
};
use futures_util::FutureExt;
use std::collections::BTreeMap;

const POSTGRES_PORT: u16 = 5432;
const PASSWORD_LEN: usize = 32;
const CREDENTIALS_FILE: &str = "credentials.json";
const CREDENTIALS_DIR: &str = "/secrets/cloudsql";
const CLOUDSQL_VOLUME: &str = "cloudsql";
const CLOUDSQL_SOCKET_DIR: &str = "/cloudsql";
const PROXY_ADMIN_PORT: u16 = 9091;
const CLIENT_ROLE: &str = "roles/cloudsql.client";

/// Password held by the engine under `logical`.
///
/// Generated on the first deploy; every later deploy gets the same value.
pub async fn stable_password(ctx: &ProvisionContext, logical: &str) -> Result<(ResourceHandle, String)> {
    let password = ctx
        .create(ResourceRequest::new(
            RANDOM_PASSWORD_KIND,
            logical,
            logical,
            serde_json::json!({ "length": PASSWORD_LEN }),
        ))
        .await?;
    let value = ctx.cancel.guard(password.attribute("result").resolve()).await?;
    Ok((password.handle, value))
}

/// Root access to an instance, as imported from its owner
#[derive(Clone)]
pub struct InstanceAccess {
    pub connection_name: String,
    pub host: String,
    pub root_user: String,
    pub root_password: String,
}

impl std::fmt::Debug for InstanceAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceAccess")
            .field("connection_name", &self.connection_name)
            .field("host", &self.host)
            .field("root_user", &self.root_user)
            .finish_non_exhaustive()
    }
}

/// Credentials and endpoint one consumer connects with
#[derive(Clone)]
pub struct ConsumerAccess {
    pub user: String,
    pub database: String,
    pub password: String,
    /// Address (or socket directory) the workload connects to
    pub host: String,
    pub port: u16,
    pub shape: ShapeKind,
}

impl ConsumerAccess {
    pub fn url(&self) -> String {
        match self.shape {
            ShapeKind::KubernetesPod => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.database
            ),
            ShapeKind::CloudRun => format!(
                "postgres://{}:{}@/{}?host={}",
                self.user, self.password, self.database, self.host
            ),
        }
    }
}

impl std::fmt::Debug for ConsumerAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerAccess")
            .field("user", &self.user)
            .field("database", &self.database)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

/// Proxy identity of one consumer
struct ProxyCredentials {
    handles: Vec<ResourceHandle>,
    /// Engine results the stack waits for before it counts as deployed
    outputs: Vec<Deferred<Attributes>>,
    /// Base64 encoded service account key
    private_key: String,
}

/// `logical` names one consumer of one instance in one environment
async fn provision_proxy_credentials(
    ctx: &ProvisionContext,
    stack: &StackDescriptor,
    logical: &str,
) -> Result<ProxyCredentials> {
    let account = ctx
        .create(ResourceRequest::new(
            "gcp-service-account",
            format!("{}--proxy-sa", logical),
            NameRules::SERVICE_ACCOUNT.apply_distinct(&format!("{}-sql", logical)),
            serde_json::json!({
                "displayName": format!("Cloud SQL proxy for {}", stack.label()),
            }),
        ))
        .await?;
    let email = ctx.cancel.guard(account.attribute("email").resolve()).await?;

    let binding = ctx
        .create(
            ResourceRequest::new(
                "gcp-project-iam-member",
                format!("{}--proxy-iam", logical),
                format!("{}-{}", CLIENT_ROLE, email),
                serde_json::json!({
                    "role": CLIENT_ROLE,
                    "member": format!("serviceAccount:{}", email),
                }),
            )
            .with_depends_on(account.handle.clone()),
        )
        .await?;

    let key = ctx
        .create(
            ResourceRequest::new(
                "gcp-service-account-key",
                format!("{}--proxy-key", logical),
                format!("{}-key", email),
                serde_json::json!({ "serviceAccount": email }),
            )
            .with_depends_on(account.handle.clone()),
        )
        .await?;
    let private_key = ctx.cancel.guard(key.attribute("privateKey").resolve()).await?;

    Ok(ProxyCredentials {
        handles: vec![account.handle, binding.handle, key.handle],
        outputs: vec![binding.attributes, key.attributes],
        private_key,
    })
}

fn credentials_volume(name: &str, private_key: &str) -> VolumeSpec {
    VolumeSpec {
        name: name.to_string(),
        source: VolumeSource::Secret {
            data: BTreeMap::from([(CREDENTIALS_FILE.to_string(), private_key.to_string())]),
        },
    }
}

fn proxy_args(connection_name: &str, port: u16) -> Vec<String> {
    vec![
        "--private-ip".to_string(),
        format!("--port={}", port),
        format!("--credentials-file={}/{}", CREDENTIALS_DIR, CREDENTIALS_FILE),
        connection_name.to_string(),
    ]
}

fn credentials_mount(volume: &str) -> VolumeMount {
    VolumeMount {
        volume: volume.to_string(),
        mount_path: CREDENTIALS_DIR.to_string(),
        read_only: true,
    }
}

/// Proxy sidecar living next to the main container
fn sidecar_container(image: &str, name: &str, volume: &str, connection_name: &str, port: u16) -> ContainerSpec {
    ContainerSpec {
        args: proxy_args(connection_name, port),
        volume_mounts: vec![credentials_mount(volume)],
        ..ContainerSpec::new(name, image)
    }
}

/// Mount the managed Cloud SQL socket volume, sharing it between instances
fn attach_cloudsql_volume(shape: &mut WorkloadShape, connection_name: &str) -> Result<()> {
    let WorkloadShape::CloudRun(run) = shape else {
        return shape.expect_kind(ShapeKind::CloudRun);
    };
    let existing = run.volumes.iter_mut().find(|v| v.name == CLOUDSQL_VOLUME);
    match existing.map(|v| &mut v.source) {
        Some(VolumeSource::CloudSql { instances }) => {
            if !instances.iter().any(|i| i == connection_name) {
                instances.push(connection_name.to_string());
            }
        }
        Some(_) => {
            return Err(StackError::config(
                "cloud-run",
                format!("volume '{}' is not a Cloud SQL volume", CLOUDSQL_VOLUME),
            ));
        }
        None => {
            run.volumes.push(VolumeSpec {
                name: CLOUDSQL_VOLUME.to_string(),
                source: VolumeSource::CloudSql {
                    instances: vec![connection_name.to_string()],
                },
            });
            let main = run
                .containers
                .first_mut()
                .ok_or_else(|| StackError::config("cloud-run", "service has no container"))?;
            main.volume_mounts.push(VolumeMount {
                volume: CLOUDSQL_VOLUME.to_string(),
                mount_path: CLOUDSQL_SOCKET_DIR.to_string(),
                read_only: false,
            });
        }
    }
    Ok(())
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Idempotent SQL creating the consumer's role and database.
///
/// The password is bound as the psql variable `consumer_password`.
fn init_sql(user: &str, database: &str) -> String {
    let role = quote_ident(user);
    let db = quote_ident(database);
    [
        format!(
            "SELECT 'CREATE ROLE {} LOGIN' WHERE NOT EXISTS (SELECT FROM pg_roles WHERE rolname = {})\\gexec",
            role,
            quote_literal(user)
        ),
        format!("ALTER ROLE {} WITH LOGIN PASSWORD :'consumer_password';", role),
        format!(
            "SELECT 'CREATE DATABASE {} OWNER {}' WHERE NOT EXISTS (SELECT FROM pg_database WHERE datname = {})\\gexec",
            db,
            role,
            quote_literal(database)
        ),
        format!("GRANT ALL PRIVILEGES ON DATABASE {} TO {};", db, role),
    ]
    .join("\n")
}

/// One-shot job creating the consumer's role and database
fn init_job(ctx: &ProvisionContext, name: &str, instance: &InstanceAccess, consumer: &ConsumerAccess, private_key: &str) -> JobSpec {
    let settings = &ctx.settings;
    let volume = "proxy-credentials";

    // The proxy quits on /quitquitquit once psql is done, and is killed at
    // the ceiling otherwise.
    let mut proxy_args = proxy_args(&instance.connection_name, POSTGRES_PORT);
    proxy_args.insert(0, "--quitquitquit".to_string());
    proxy_args.insert(1, format!("--admin-port={}", PROXY_ADMIN_PORT));
    let mut command = vec![
        "timeout".to_string(),
        format!("{}s", settings.proxy_ceiling().as_secs()),
        "/cloud-sql-proxy".to_string(),
    ];
    command.extend(proxy_args);
    let proxy = ContainerSpec {
        command,
        volume_mounts: vec![credentials_mount(volume)],
        ..ContainerSpec::new("cloud-sql-proxy", &settings.cloudsql_proxy_image)
    };

    let script = format!(
        "until pg_isready -q; do sleep 1; done\n\
         psql -v ON_ERROR_STOP=1 -v consumer_password=\"$CONSUMER_PASSWORD\" <<'SQL'\n{}\nSQL\n\
         status=$?\n\
         wget -q -O- --post-data='' http://127.0.0.1:{}/quitquitquit >/dev/null 2>&1\n\
         exit $status",
        init_sql(&consumer.user, &consumer.database),
        PROXY_ADMIN_PORT
    );
    let client = ContainerSpec {
        command: vec!["/bin/sh".to_string(), "-c".to_string(), script],
        env: BTreeMap::from([
            ("PGHOST".to_string(), "127.0.0.1".to_string()),
            ("PGPORT".to_string(), POSTGRES_PORT.to_string()),
            ("PGUSER".to_string(), instance.root_user.clone()),
            ("PGDATABASE".to_string(), "postgres".to_string()),
        ]),
        secret_env: BTreeMap::from([
            ("PGPASSWORD".to_string(), instance.root_password.clone()),
            ("CONSUMER_PASSWORD".to_string(), consumer.password.clone()),
        ]),
        ..ContainerSpec::new("psql", &settings.postgres_client_image)
    };

    JobSpec {
        name: name.to_string(),
        containers: vec![proxy, client],
        volumes: vec![credentials_volume(volume, private_key)],
        timeout: settings.init_job_timeout(),
    }
}

/// Run the init job within its own window, independent of the stack deadline
async fn run_init_job(ctx: &ProvisionContext, job: &JobSpec) -> Result<()> {
    let failed = |message: String| StackError::InitJobFailed {
        job: job.name.clone(),
        message,
    };
    tracing::info!(job = %job.name, timeout = ?job.timeout, "Running database init job");

    let run = ctx.cancel.guard(async {
        ctx.engine.run_job(job).await.map_err(StackError::from)
    });
    let outcome = match tokio::time::timeout(job.timeout, run).await {
        Err(_) => return Err(failed(format!("timed out after {}s", job.timeout.as_secs()))),
        Ok(Err(e)) if e.is_cancelled() => return Err(e),
        Ok(Err(e)) => return Err(failed(e.to_string())),
        Ok(Ok(outcome)) => outcome,
    };
    if !outcome.is_success() {
        return Err(failed(format!(
            "exit code {}: {}",
            outcome.exit_code,
            outcome.logs.trim()
        )));
    }
    tracing::info!(job = %job.name, duration_ms = outcome.duration_ms, "Database init job finished");
    Ok(())
}

/// Wire one consumer of a Cloud SQL instance into the workload
pub async fn provision_consumer(
    ctx: &ProvisionContext,
    stack: &StackDescriptor,
    resource: &ConsumedResource,
    collector: &ComputeContextCollector,
    params: &ProcessParams,
    instance: &InstanceAccess,
) -> Result<ConsumerAccess> {
    let identity = consumer_identity(&stack.name, &resource.relation);
    let user = NameRules::POSTGRES_IDENTIFIER.apply_distinct(&identity);
    let logical = format!("{}--{}--{}", resource.derived_name, identity, stack.naming_env());
    let slot = collector.slot();

    let (host, port) = match params.shape {
        ShapeKind::KubernetesPod => {
            let port = u16::try_from(slot)
                .ok()
                .and_then(|s| POSTGRES_PORT.checked_add(s))
                .ok_or_else(|| StackError::config(&resource.descriptor.name, "too many consumed databases"))?;
            ("127.0.0.1".to_string(), port)
        }
        ShapeKind::CloudRun => (
            format!("{}/{}", CLOUDSQL_SOCKET_DIR, instance.connection_name),
            POSTGRES_PORT,
        ),
    };
    let (_, password) = stable_password(ctx, &format!("{}--password", logical)).await?;
    let consumer = ConsumerAccess {
        database: user.clone(),
        user,
        password,
        host,
        port,
        shape: params.shape,
    };

    let credentials = provision_proxy_credentials(ctx, stack, &logical).await?;
    for handle in &credentials.handles {
        collector.add_dependency(handle.clone());
    }
    for output in &credentials.outputs {
        collector.add_output(output);
    }

    let env = EnvWriter::new(collector, resource);
    env.plain("PGHOST", &consumer.host);
    env.plain("PGPORT", &consumer.port.to_string());
    env.plain("PGUSER", &consumer.user);
    env.plain("PGDATABASE", &consumer.database);
    env.secret("PGPASSWORD", &consumer.password);
    env.secret("POSTGRES_PASSWORD", &consumer.password);
    env.secret("DATABASE_URL", &consumer.url());

    let label = format!("cloud-sql-proxy for {}", resource.template_key());
    match params.shape {
        ShapeKind::KubernetesPod => {
            let image = ctx.settings.cloudsql_proxy_image.clone();
            let container = format!("cloud-sql-proxy-{}", slot);
            let volume = format!("cloudsql-credentials-{}", slot);
            let connection_name = instance.connection_name.clone();
            let private_key = credentials.private_key.clone();
            let port = consumer.port;
            collector.add_pre_processor(ShapeKind::KubernetesPod, label, move |shape| {
                shape.append_container(sidecar_container(&image, &container, &volume, &connection_name, port));
                shape.append_volume(credentials_volume(&volume, &private_key));
                Ok(())
            });
        }
        ShapeKind::CloudRun => {
            let connection_name = instance.connection_name.clone();
            collector.add_pre_processor(ShapeKind::CloudRun, label, move |shape| {
                attach_cloudsql_volume(shape, &connection_name)
            });
        }
    }

    let job = init_job(
        ctx,
        &NameRules::KUBERNETES_NAME.apply_distinct(&format!("pg-init-{}", logical)),
        instance,
        &consumer,
        &credentials.private_key,
    );
    let job_ctx = ctx.clone();
    collector.add_post_processor(
        params.shape,
        format!("init database '{}'", consumer.database),
        move |_deployed| async move { run_init_job(&job_ctx, &job).await }.boxed(),
    );

    tracing::debug!(
        stack = %stack.reference(),
        resource = %resource.descriptor.name,
        user = %consumer.user,
        "Wired Cloud SQL consumer"
    );
    Ok(consumer)
}
