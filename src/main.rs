use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Attribute, Cell, Table};
use rollout::events::TracingEventWriter;
use rollout::git::GitRepo;
use rollout::manifest::YamlManifests;
use rollout::platform::{Platform, ServiceId};
use rollout::registry::client_from_settings;
use rollout::release::{
    ImageSelector, ImageSpec, ReleaseEnv, ReleaseError, ReleaseKind, ReleaseOutcome,
    ReleaseRequest, Releaser, ServiceSelector, ServiceSpec,
};
use rollout::settings::Settings;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Release new images to running services
    #[command(visible_alias = "r")]
    Release {
        /// Image to release: "<all latest>", "<no updates>" or an exact reference
        #[arg(long, default_value = "<all latest>")]
        image: String,
        /// Services to release to ("<all>" or namespace/name); repeatable
        #[arg(long = "service", required = true)]
        services: Vec<String>,
        /// Services to leave alone; repeatable
        #[arg(long = "exclude")]
        excludes: Vec<String>,
        /// Perform the release instead of only planning it
        #[arg(long)]
        execute: bool,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show running images next to the latest available ones
    #[command(visible_alias = "ls")]
    Images {
        /// Services to inspect ("<all>" or namespace/name); repeatable
        #[arg(long = "service", default_value = "<all>")]
        services: Vec<String>,
    },
    /// Load the configuration and check the platform is reachable
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = Settings::new().context("Failed to load configuration")?;

    match cli.command {
        Commands::Release {
            image,
            services,
            excludes,
            execute,
            json,
        } => {
            let request = ReleaseRequest {
                image_spec: ImageSpec::parse(&image)?,
                service_specs: services
                    .iter()
                    .map(|s| ServiceSpec::parse(s))
                    .collect::<Result<_, _>>()?,
                excludes: excludes
                    .iter()
                    .map(|s| ServiceId::parse(s))
                    .collect::<Result<_, _>>()?,
                kind: if execute {
                    ReleaseKind::Execute
                } else {
                    ReleaseKind::Plan
                },
            };

            let releaser = Releaser::new(release_env(&settings).await?);
            match releaser
                .handle(&request, &|message: &str| eprintln!("{}", message))
                .await
            {
                Ok(outcome) => report_outcome(&outcome, json)?,
                Err(ReleaseError::Failed { outcome, source }) => {
                    report_outcome(&outcome, json)?;
                    return Err(anyhow::Error::new(*source).context("Release failed"));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Images { services } => {
            let specs: Vec<ServiceSpec> = services
                .iter()
                .map(|s| ServiceSpec::parse(s))
                .collect::<Result<_, _>>()?;
            let env = release_env(&settings).await?;
            list_images(&env, &specs).await?;
        }
        Commands::CheckConfig => {
            let env = release_env(&settings).await?;
            env.ping().await.context("Platform is not reachable")?;
            let version = env.version().await?;
            info!(platform_version = %version, "Configuration OK");
            println!("Configuration OK (platform {})", version);
        }
    }

    Ok(())
}

async fn release_env(settings: &Settings) -> Result<ReleaseEnv> {
    let Some(git) = &settings.git else {
        bail!("No config repo configured; set git.url");
    };

    let registry = client_from_settings(&settings.registry)?;
    let platform = connect_platform(settings).await?;
    Ok(ReleaseEnv::new(
        platform,
        registry,
        Arc::new(GitRepo::new(git)),
        Arc::new(YamlManifests::new()),
        Arc::new(TracingEventWriter),
    )
    .with_namespace(settings.platform.namespace.clone())
    .with_self_service_names(settings.platform.self_service_names.clone()))
}

#[cfg(feature = "k8s")]
async fn connect_platform(settings: &Settings) -> Result<Arc<dyn Platform>> {
    let platform =
        rollout::platform::kubernetes::KubernetesPlatform::connect(&settings.platform.field_manager)
            .await?;
    Ok(Arc::new(platform))
}

#[cfg(not(feature = "k8s"))]
async fn connect_platform(_settings: &Settings) -> Result<Arc<dyn Platform>> {
    bail!("Built without a platform connector; enable the k8s feature")
}

fn report_outcome(outcome: &ReleaseOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        print_outcome(outcome);
    }
    Ok(())
}

fn print_outcome(outcome: &ReleaseOutcome) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("#").add_attribute(Attribute::Bold),
            Cell::new("ACTION").add_attribute(Attribute::Bold),
            Cell::new("DESCRIPTION").add_attribute(Attribute::Bold),
            Cell::new("RESULT").add_attribute(Attribute::Bold),
        ]);

    for (i, action) in outcome.actions.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(action.name()),
            Cell::new(&action.description),
            Cell::new(action.result.as_deref().unwrap_or("-")),
        ]);
    }

    println!("{}", table);
    println!(
        "Release {} ({}): {}",
        outcome.id, outcome.release_type, outcome.status
    );
}

async fn list_images(env: &ReleaseEnv, specs: &[ServiceSpec]) -> Result<()> {
    let selector = ServiceSelector::for_specs(specs, &[])?;
    let services = selector.select_services(env).await?;
    let available = ImageSelector::AllLatest
        .select_images(env, &services)
        .await?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("SERVICE").add_attribute(Attribute::Bold),
            Cell::new("CONTAINER").add_attribute(Attribute::Bold),
            Cell::new("RUNNING").add_attribute(Attribute::Bold),
            Cell::new("LATEST").add_attribute(Attribute::Bold),
        ]);

    for service in &services {
        let Some(containers) = &service.containers else {
            table.add_row(vec![service.id.to_string(), "?".into(), "?".into(), "-".into()]);
            continue;
        };
        for container in containers {
            let latest = rollout::image::ImageId::parse(&container.image)
                .ok()
                .and_then(|id| available.latest_image(&id.repository()).cloned())
                .map(|d| d.id.to_string())
                .unwrap_or_else(|| "-".to_string());
            table.add_row(vec![
                service.id.to_string(),
                container.name.clone(),
                container.image.clone(),
                latest,
            ]);
        }
    }

    println!("{}", table);
    Ok(())
}
