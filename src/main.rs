use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kapi::{
    ApiNode, ApiOptions, ConnectionDescriptor, KubernetesApi, Query, WatchNotification,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// API server url, e.g. https://127.0.0.1:6443 or http://127.0.0.1:8001
    #[arg(short, long)]
    server: String,

    /// Namespace for namespaced resources
    #[arg(short, long)]
    namespace: Option<String>,

    /// Bearer token sent as the authorization header
    #[arg(long)]
    token: Option<String>,

    /// PEM file with the cluster certificate authority
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// PEM file with the client certificate
    #[arg(long, requires = "key_file")]
    cert_file: Option<PathBuf>,

    /// PEM file with the client private key
    #[arg(long, requires = "cert_file")]
    key_file: Option<PathBuf>,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// JSON file with client options (aliases, customResources, query, watch)
    #[arg(long)]
    options: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every discovered resource and its verbs
    Tree,
    /// Get one object, e.g. `get api.v1.configmaps my-config`
    Get { path: String, name: String },
    /// List a resource collection
    List {
        path: String,
        /// Label selector, e.g. `app=web`
        #[arg(short = 'l', long)]
        selector: Option<String>,
    },
    /// Stream changes until interrupted
    Watch { path: String, name: Option<String> },
}

async fn read_file(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

async fn descriptor(args: &Args) -> Result<ConnectionDescriptor> {
    let mut descriptor =
        ConnectionDescriptor::from_url(&args.server)?.reject_unauthorized(!args.insecure);

    if let Some(token) = &args.token {
        descriptor = descriptor.with_bearer_token(token);
    }
    if let Some(ca) = &args.ca_file {
        descriptor = descriptor.with_ca(read_file(ca).await?);
    }
    if let (Some(cert), Some(key)) = (&args.cert_file, &args.key_file) {
        descriptor = descriptor.with_client_identity(read_file(cert).await?, read_file(key).await?);
    }
    Ok(descriptor)
}

async fn options(args: &Args) -> Result<ApiOptions> {
    let mut options: ApiOptions = match &args.options {
        Some(path) => serde_json::from_str(&read_file(path).await?)
            .with_context(|| format!("parsing {}", path.display()))?,
        None => ApiOptions::default(),
    };
    if args.namespace.is_some() {
        options.namespace.clone_from(&args.namespace);
    }
    Ok(options)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_tree(api: &KubernetesApi) {
    for resource in api.tree().resources() {
        let descriptor = resource.descriptor();
        let verbs: Vec<&str> = descriptor.verbs.iter().map(|verb| verb.as_str()).collect();
        println!(
            "{:<60} {:<28} {}",
            descriptor.dotted_path(),
            descriptor.kind,
            verbs.join(",")
        );
    }
}

async fn watch(api: &KubernetesApi, path: &str, name: Option<&str>) -> Result<()> {
    let watch = api.at(path)?.watch(name, &Query::default())?;
    let mut rx = watch.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                watch.unsubscribe();
            }
            notification = rx.recv() => match notification {
                Some(WatchNotification::Event(event)) => {
                    let object = event.object();
                    let name = object
                        .pointer("/metadata/name")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    println!("{:<9} {}", event.name(), name);
                }
                Some(WatchNotification::Reconnect) => eprintln!("-- reconnecting"),
                Some(WatchNotification::Closed) | None => break,
            },
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let descriptor = descriptor(&args).await?;
    let options = options(&args).await?;
    let api = KubernetesApi::connect(&descriptor, options)
        .await
        .context("building the api client")?;

    match &args.command {
        Command::Tree => print_tree(&api),
        Command::Get { path, name } => {
            let object = api.at(path)?.get(name, &Query::default()).await?;
            print_json(&object)?;
        }
        Command::List { path, selector } => {
            let mut query = Query::new();
            if let Some(selector) = selector {
                query = query.label_selector(selector);
            }
            let list = match api.lookup(path) {
                Some(ApiNode::Resource(resource)) => resource.list(&query).await?,
                _ => api.resource(path).list(&query).await?,
            };
            print_json(&list)?;
        }
        Command::Watch { path, name } => watch(&api, path, name.as_deref()).await?,
    }
    Ok(())
}
