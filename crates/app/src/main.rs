#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tenant_clients::{AdmHttpClient, CatalogHttpClient, HarborHttpClient, TokenSource};
use tenant_core::{ProjectListener, SecretReader};
use tenant_engine::{Config, Engine, PluginRegistry, WatcherGuard};
use tenant_kubehub::KubeHub;
use tenant_manifest::{ArtifactPuller, LocalPuller, ManifestSource, OciPuller};
use tenant_plugins::{CatalogPlugin, ExtensionsPlugin, HarborPlugin, ReleaseService};
use tracing::{error, info, warn};

mod health;

use health::Readiness;

#[derive(Parser, Debug)]
#[command(name = "tenant-controller", version, about = "Provisions Harbor, catalog and extension deployments for tenant projects")]
struct Args {
    /// Harbor core URL
    #[arg(long, env = "HARBOR_SERVER")]
    harbor_server: String,
    /// Secret holding the Harbor admin `user:password` credential
    #[arg(long, env = "HARBOR_ADMIN_SECRET", default_value = "harbor-admin-credential")]
    harbor_admin_secret: String,
    /// Key inside the admin secret
    #[arg(long, env = "HARBOR_ADMIN_SECRET_KEY", default_value = "credential")]
    harbor_admin_secret_key: String,
    /// OCI address of Harbor as seen by the catalog (`oci://host`)
    #[arg(long, env = "HARBOR_OCI_URL")]
    harbor_oci_url: String,
    /// OIDC client id Harbor logs users in with; OIDC is left untouched when unset
    #[arg(long, env = "HARBOR_OIDC_CLIENT_ID")]
    harbor_oidc_client_id: Option<String>,
    #[arg(long, env = "HARBOR_OIDC_CLIENT_SECRET", hide_env_values = true)]
    harbor_oidc_client_secret: Option<String>,
    #[arg(long, env = "CATALOG_SERVER")]
    catalog_server: String,
    /// Application deployment manager URL
    #[arg(long, env = "ADM_SERVER")]
    adm_server: String,
    #[arg(long, env = "KEYCLOAK_SERVER")]
    keycloak_server: String,
    #[arg(long, env = "KEYCLOAK_REALM", default_value = "master")]
    keycloak_realm: String,
    /// Secret with `client_id` and `client_secret` for the token exchange
    #[arg(long, env = "CLIENT_SECRET_NAME", default_value = "tenant-controller-client")]
    client_secret_name: String,
    #[arg(long, env = "SECRET_NAMESPACE", default_value = "orch-platform")]
    secret_namespace: String,
    /// Release service OCI base for chart and image registries
    #[arg(long, env = "RELEASE_SERVICE_BASE", default_value = "oci://registry-rs.edgeorchestration.intel.com")]
    release_service_base: String,
    /// Registry the manifest and packages are pulled from
    #[arg(long, env = "REGISTRY_URL", default_value = "registry-rs.edgeorchestration.intel.com")]
    registry_url: String,
    /// Pull from this directory instead of a registry (air-gapped installs)
    #[arg(long, env = "LOCAL_ARTIFACT_ROOT")]
    local_artifact_root: Option<String>,
    #[arg(long, env = "MANIFEST_PATH", default_value = "edge-orch/en/files/manifest")]
    manifest_path: String,
    #[arg(long, env = "MANIFEST_TAG")]
    manifest_tag: String,
    /// Inline manifest document used instead of pulling
    #[arg(long, env = "MANIFEST_OVERRIDE")]
    manifest_override: Option<String>,
    #[arg(long, env = "NUMBER_WORKER_THREADS", default_value_t = 2)]
    workers: usize,
    /// Seconds between retries of a failed event
    #[arg(long, env = "INITIAL_SLEEP_INTERVAL", default_value_t = 10)]
    initial_sleep_interval: u64,
    /// Seconds an event may keep retrying
    #[arg(long, env = "MAX_WAIT_TIME", default_value_t = 600)]
    max_wait_time: u64,
    /// Seconds one dispatch attempt may take
    #[arg(long, env = "ATTEMPT_TIMEOUT", default_value_t = 120)]
    attempt_timeout: u64,
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,
    #[arg(long, env = "APP_NAME", default_value = "tenant-controller")]
    app_name: String,
}

impl Args {
    fn engine_config(&self) -> Config {
        Config {
            workers: self.workers,
            initial_sleep_interval: Duration::from_secs(self.initial_sleep_interval),
            max_wait_time: Duration::from_secs(self.max_wait_time),
            attempt_timeout: Duration::from_secs(self.attempt_timeout),
            manifest_tag: self.manifest_tag.clone(),
            app_name: self.app_name.clone(),
        }
    }

    fn manifest_source(&self) -> ManifestSource {
        match self.manifest_override.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(doc) => ManifestSource::Override(doc.to_string()),
            None => ManifestSource::Remote { path: self.manifest_path.clone(), tag: self.manifest_tag.clone() },
        }
    }

    fn puller(&self) -> Arc<dyn ArtifactPuller> {
        match &self.local_artifact_root {
            Some(root) => Arc::new(LocalPuller::new(root)),
            None => Arc::new(OciPuller::new(&self.registry_url)),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("TENANT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TENANT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TENANT_METRICS_ADDR; expected host:port");
        }
    }
}

async fn harbor_client(args: &Args, secrets: &dyn SecretReader) -> Result<HarborHttpClient> {
    let data = secrets.read_secret(&args.harbor_admin_secret).await?;
    let raw = data
        .get(&args.harbor_admin_secret_key)
        .ok_or_else(|| anyhow!("secret {} has no {} key", args.harbor_admin_secret, args.harbor_admin_secret_key))?;
    let credential = String::from_utf8_lossy(raw);
    Ok(HarborHttpClient::from_credential(&args.harbor_server, &credential)?)
}

/// Harbor first: later plugins read the robot credential it publishes.
async fn build_registry(args: &Args, secrets: Arc<dyn SecretReader>) -> Result<PluginRegistry> {
    let mut harbor = HarborPlugin::new(Arc::new(harbor_client(args, secrets.as_ref()).await?));
    if let (Some(id), Some(secret)) = (&args.harbor_oidc_client_id, &args.harbor_oidc_client_secret) {
        let endpoint = format!("{}/realms/{}", args.keycloak_server.trim_end_matches('/'), args.keycloak_realm);
        harbor = harbor.with_configuration(HarborPlugin::oidc_configuration(&endpoint, id, secret));
    }

    let tokens = Arc::new(TokenSource::client_credentials(&args.keycloak_server, &args.keycloak_realm, secrets, &args.client_secret_name));
    let catalog = Arc::new(CatalogHttpClient::new(&args.catalog_server, Arc::clone(&tokens)));
    let deployments = Arc::new(AdmHttpClient::new(&args.adm_server, tokens));

    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(harbor));
    registry.register(Arc::new(CatalogPlugin::new(catalog.clone(), &args.harbor_oci_url, ReleaseService::from_base(&args.release_service_base))));
    registry.register(Arc::new(ExtensionsPlugin::new(args.manifest_source(), args.puller(), catalog, deployments)));
    info!(plugins = ?registry.names(), "plugins registered");
    Ok(registry)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }
}

async fn run(args: Args) -> Result<()> {
    let ready = Readiness::default();
    let health = tokio::spawn(health::serve(args.health_addr, ready.clone()));

    let client = tenant_kubehub::get_kube_client().await?;
    let hub = KubeHub::connect(client, &tenant_kubehub::project_gvk_key()).await?;
    let secrets: Arc<dyn SecretReader> = Arc::new(hub.secrets(&args.secret_namespace));

    let registry = build_registry(&args, secrets).await?;
    let engine = Engine::new(args.engine_config(), registry).context("invalid engine configuration")?;
    engine.initialize().await.context("plugin initialisation failed")?;
    let workers = engine.start();
    ready.mark_ready();
    info!(workers = workers.len(), app = %args.app_name, "tenant controller ready");

    let guard: Arc<dyn ProjectListener> = Arc::new(WatcherGuard::new(engine.handle(), engine.config()));
    tokio::select! {
        res = hub.watch_projects(guard) => res?,
        res = health => res.context("health task panicked")??,
        _ = shutdown_signal() => info!("shutdown signal received"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = ?e, "tenant controller stopped");
        std::process::exit(1);
    }
}
