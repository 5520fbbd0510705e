use crate::{
    api::Api,
    controller::Controller,
    core::{
        issue::ClaimOptions,
        link::LinkOptions,
        resolve::Ingress,
        site::{RouterTuning, Site},
        RouterMode,
    },
    k8s::Secret,
    metrics::ApiMetrics,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use prometheus_client::registry::Registry;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Parser)]
#[clap(
    name = "site-controller",
    about = "Establishes and polices links between VAN sites"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "van=info,warn",
        env = "VAN_SITE_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    site: SiteArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct SiteArgs {
    /// Identifies this site in the tokens it generates.
    #[clap(long, env = "SKUPPER_SITE_ID")]
    site_id: String,

    #[clap(long, env = "NAMESPACE")]
    namespace: String,

    #[clap(long, env = "SKUPPER_SITE_VERSION")]
    site_version: String,

    #[clap(long, default_value = "interior")]
    router_mode: RouterMode,

    /// How the site's endpoints are exposed outside the cluster: route,
    /// loadbalancer, nodeport, contour-http-proxy, ingress or none.
    #[clap(long, default_value = "loadbalancer")]
    ingress: String,

    /// The host under which nodeport and contour-http-proxy ingresses are
    /// reachable.
    #[clap(long)]
    ingress_host: Option<String>,

    #[clap(long)]
    max_frame_size: Option<u32>,

    #[clap(long)]
    max_session_frames: Option<u32>,

    /// Bounds how long to wait for a load balancer address.
    #[clap(long, default_value = "120")]
    resolve_timeout_secs: u64,

    #[clap(long, default_value = "30")]
    claim_timeout_secs: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serves claim redemptions and policy queries.
    Serve {
        #[clap(flatten)]
        server: kubert::ServerArgs,

        #[clap(flatten)]
        admin: kubert::AdminArgs,
    },

    #[clap(flatten)]
    Site(SiteCommand),
}

/// One-shot operations on the site.
#[derive(Debug, Subcommand)]
enum SiteCommand {
    /// Creates the site's certificate authorities and router credentials.
    Init,

    /// Issues a connection token.
    CreateToken {
        /// Names the client credential carried by the token.
        #[clap(long)]
        subject: String,

        /// Writes the token to a file rather than stdout.
        #[clap(long, short)]
        output: Option<PathBuf>,
    },

    /// Issues a claim token that can be redeemed for a connection token.
    CreateClaim {
        #[clap(long)]
        name: Option<String>,

        #[clap(long)]
        password: Option<String>,

        #[clap(long, default_value = "900")]
        expiry_secs: u64,

        #[clap(long, default_value = "1")]
        uses: u32,

        #[clap(long, short)]
        output: Option<PathBuf>,
    },

    /// Links this site to another using a token file.
    Link {
        #[clap(long, short)]
        file: PathBuf,

        #[clap(long)]
        name: Option<String>,

        #[clap(long)]
        cost: Option<u32>,
    },

    /// Removes a link.
    Unlink { name: String },

    /// Lists this site's outgoing links.
    Links,

    /// Invalidates every token this site has issued.
    RevokeAccess,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            site,
            command,
        } = self;

        let resolve_timeout = Duration::from_secs(site.resolve_timeout_secs);
        let claim_timeout = Duration::from_secs(site.claim_timeout_secs);
        let site = site.into_site()?;

        let command = match command {
            Command::Serve { server, admin } => {
                let mut prom = <Registry>::default();
                let metrics = ApiMetrics::register(prom.sub_registry_with_prefix("site_api"));
                let rt_metrics =
                    kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

                let runtime = kubert::Runtime::builder()
                    .with_log(log_level, log_format)
                    .with_metrics(rt_metrics)
                    .with_admin(admin.into_builder().with_prometheus(prom))
                    .with_client(client)
                    .with_server(server)
                    .build()
                    .await?;

                let controller =
                    Controller::new(runtime.client(), site, resolve_timeout, claim_timeout);
                controller.init().await?;

                let runtime = runtime.spawn_server(Api::new(
                    controller.redeemer,
                    controller.policy,
                    metrics,
                ));

                // Block the main thread on the shutdown signal.
                if runtime.run().await.is_err() {
                    bail!("Aborted");
                }
                return Ok(());
            }
            Command::Site(command) => command,
        };

        log_format.try_init(log_level)?;
        let client = client.try_client().await?;
        let controller = Controller::new(client, site, resolve_timeout, claim_timeout);

        match command {
            SiteCommand::Init => controller.init().await?,
            SiteCommand::CreateToken { subject, output } => {
                let (token, local_only) =
                    controller.issuer.create_connection_token(&subject).await?;
                warn_local_only(local_only);
                write_secret(token.secret(), output)?;
            }
            SiteCommand::CreateClaim {
                name,
                password,
                expiry_secs,
                uses,
                output,
            } => {
                let options = ClaimOptions {
                    name,
                    password: password.map(String::into_bytes),
                    expiry: Duration::from_secs(expiry_secs),
                    uses,
                };
                let (claim, local_only) = controller.issuer.create_claim_token(options).await?;
                warn_local_only(local_only);
                write_secret(claim.secret(), output)?;
            }
            SiteCommand::Link { file, name, cost } => {
                let yaml = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                let secret = serde_yaml::from_str::<Secret>(&yaml)
                    .with_context(|| format!("{} is not a token", file.display()))?;
                let connector = controller
                    .links
                    .apply_token(secret, LinkOptions { name, cost })
                    .await?;
                println!(
                    "Link {} created to {}:{}",
                    connector.name, connector.host, connector.port
                );
            }
            SiteCommand::Unlink { name } => {
                if controller.links.remove_link(&name).await? {
                    println!("Link {name} removed");
                } else {
                    println!("No such link {name}");
                }
            }
            SiteCommand::Links => {
                for link in controller.links.list_links().await? {
                    println!(
                        "{}\t{}:{}\t{}\t{}",
                        link.name,
                        link.host,
                        link.port,
                        link.role,
                        link.remote_site.as_deref().unwrap_or("-"),
                    );
                }
            }
            SiteCommand::RevokeAccess => {
                let revocation = controller.revoker.revoke_access().await?;
                println!(
                    "Access revoked; {} outstanding claims deleted",
                    revocation.claims_deleted
                );
            }
        }
        Ok(())
    }
}

impl SiteArgs {
    fn into_site(self) -> Result<Site> {
        let ingress = Ingress::from_parts(&self.ingress, self.ingress_host)?;
        Ok(Site {
            id: self.site_id,
            namespace: self.namespace,
            mode: self.router_mode,
            version: self.site_version,
            ingress,
            tuning: RouterTuning {
                max_frame_size: self.max_frame_size,
                max_session_frames: self.max_session_frames,
            },
        })
    }
}

fn warn_local_only(local_only: bool) {
    if local_only {
        tracing::warn!("Token can only be used from within this site's cluster");
    }
}

fn write_secret(secret: &Secret, output: Option<PathBuf>) -> Result<()> {
    let yaml = serde_yaml::to_string(secret)?;
    match output {
        Some(path) => std::fs::write(&path, yaml)
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            print!("{yaml}");
            Ok(())
        }
    }
}
