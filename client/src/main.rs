use anyhow::{Context, Result};
use direktiv_functions_core::FunctionDefinition;
use futures::prelude::*;
use std::collections::HashMap;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "functions", about = "Functions control plane client")]
struct Command {
    #[structopt(long, default_value = "http://127.0.0.1:5555")]
    server: String,
    #[structopt(subcommand)]
    command: ClientCommand,
}

#[derive(Debug, StructOpt)]
enum ClientCommand {
    /// Create a function from a YAML definition file.
    Create {
        file: String,
    },
    /// Update a function, shifting `traffic` percent onto the new revision.
    Update {
        service: String,
        file: String,
        #[structopt(short, long, default_value = "100")]
        traffic: i32,
    },
    Delete {
        service: String,
    },
    Get {
        service: String,
    },
    /// List functions matching `key=value` label selectors.
    List {
        labels: Vec<String>,
    },
    /// Set an explicit traffic split from `revision=percent` pairs.
    Traffic {
        service: String,
        targets: Vec<String>,
    },
    Pods {
        labels: Vec<String>,
    },
    /// Run a one-shot execution and print its address.
    Exec {
        file: String,
        #[structopt(short, long)]
        action: String,
        #[structopt(short, long)]
        instance: String,
        #[structopt(short, long, default_value = "0")]
        step: i64,
    },
    Cancel {
        action: String,
    },
    /// Stream function events matching label selectors.
    Watch {
        labels: Vec<String>,
    },
    Logs {
        pod: String,
    },
    Registries {
        namespace: String,
    },
    StoreRegistry {
        namespace: String,
        url: String,
        /// `user:token` credential pair.
        data: String,
    },
    DeleteRegistry {
        namespace: String,
        url: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let Command { server, command } = Command::from_args();

    let mut client = direktiv_functions_client::Client::connect(server).await?;

    match command {
        ClientCommand::Create { file } => {
            client.create_function(&load_definition(&file)?).await?;
            Ok(())
        }

        ClientCommand::Update {
            service,
            file,
            traffic,
        } => {
            client
                .update_function(service, &load_definition(&file)?, traffic)
                .await?;
            Ok(())
        }

        ClientCommand::Delete { service } => client.delete_function(service).await,

        ClientCommand::Get { service } => {
            let function = client.get_function(service).await?;
            println!("{:#?}", function);
            Ok(())
        }

        ClientCommand::List { labels } => {
            let list = client.list_functions(parse_labels(&labels)?).await?;
            println!("{:#?}", list);
            Ok(())
        }

        ClientCommand::Traffic { service, targets } => {
            let targets = targets
                .iter()
                .map(|pair| {
                    let (revision, percent) = pair
                        .split_once('=')
                        .with_context(|| format!("invalid target: {}", pair))?;
                    Ok((revision.to_string(), percent.parse()?))
                })
                .collect::<Result<Vec<_>>>()?;
            client.set_traffic(service, targets).await
        }

        ClientCommand::Pods { labels } => {
            let pods = client.list_pods(parse_labels(&labels)?).await?;
            println!("{:#?}", pods);
            Ok(())
        }

        ClientCommand::Exec {
            file,
            action,
            instance,
            step,
        } => {
            let rsp = client
                .create_pod(&load_definition(&file)?, action, instance, step)
                .await?;
            println!("{} {}", rsp.ip, rsp.hostname);
            Ok(())
        }

        ClientCommand::Cancel { action } => client.cancel_pod(action).await,

        ClientCommand::Watch { labels } => {
            let mut updates = client.watch_functions(parse_labels(&labels)?).await?;
            while let Some(res) = updates.next().await {
                match res {
                    Ok(update) => println!("{:#?}", update),
                    Err(error) => eprintln!("Update failed: {}", error),
                }
            }
            eprintln!("Stream closed");
            Ok(())
        }

        ClientCommand::Logs { pod } => {
            let mut chunks = client.watch_logs(pod).await?;
            while let Some(res) = chunks.next().await {
                match res {
                    Ok(chunk) => print!("{}", chunk),
                    Err(error) => eprintln!("Log read failed: {}", error),
                }
            }
            Ok(())
        }

        ClientCommand::Registries { namespace } => {
            let registries = client.get_registries(namespace).await?;
            println!("{:#?}", registries);
            Ok(())
        }

        ClientCommand::StoreRegistry {
            namespace,
            url,
            data,
        } => client.store_registry(namespace, url, data).await,

        ClientCommand::DeleteRegistry { namespace, url } => {
            client.delete_registry(namespace, url).await
        }
    }
}

fn load_definition(path: &str) -> Result<FunctionDefinition> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let fd = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path))?;
    Ok(fd)
}

fn parse_labels(pairs: &[String]) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (k, v) = pair
                .split_once('=')
                .with_context(|| format!("invalid label selector: {}", pair))?;
            Ok((k.to_string(), v.to_string()))
        })
        .collect()
}
