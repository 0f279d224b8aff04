use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dicom_core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::InMemDicomObject;
use dimse::{
    uids, AssociationListener, DimseScu, EchoHandler, MoveIdentifier, QueryLevel, RemoteNode,
    ServiceRegistry, StoreHandler,
};
use futures_util::StreamExt;

use crate::config::{Config, ConfigError};
use crate::storage::FilesystemStorage;

#[derive(Parser, Debug)]
#[command(name = "dimse-node")]
#[command(about = "DICOM query/retrieve node", long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Local (calling) AE title, overrides node.ae_title
    #[arg(short = 'a', long, global = true)]
    pub aet: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Accept associations: C-ECHO, C-FIND over the archive, C-STORE into it
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Archive directory, overrides storage.path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Verify connectivity with a C-ECHO
    Echo {
        #[command(flatten)]
        target: TargetArgs,
        /// Retry recoverable failures with exponential backoff
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
    /// Query a remote node with C-FIND
    Find {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(short, long, value_enum, default_value_t = Model::Study)]
        model: Model,
        #[arg(short = 'L', long, default_value = "STUDY")]
        level: QueryLevel,
        /// Matching or return key as Keyword=Value (e.g. PatientName=DOE*)
        #[arg(short, long = "key")]
        keys: Vec<String>,
    },
    /// Retrieve a study or series with C-MOVE
    Retrieve {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        study: String,
        #[arg(long)]
        series: Option<String>,
        /// Move destination; defaults to the local AE title, which starts a local storage listener
        #[arg(long)]
        dest_aet: Option<String>,
        /// Archive directory for received data, overrides storage.path
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Port of the local storage listener, overrides node.port
        #[arg(long)]
        listen_port: Option<u16>,
    },
}

/// Where to send a request: a configured remote or an explicit address
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Named entry from the [remotes] table
    #[arg(short, long, conflicts_with_all = ["host", "port", "called_aet"])]
    pub remote: Option<String>,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(short, long, default_value_t = dimse::DEFAULT_DIMSE_PORT)]
    pub port: u16,
    /// Called AE title
    #[arg(long, default_value = "ANY-SCP")]
    pub called_aet: String,
}

impl TargetArgs {
    pub fn resolve(&self, config: &Config) -> Result<RemoteNode, ConfigError> {
        match &self.remote {
            Some(name) => config.remote(name).cloned(),
            None => Ok(RemoteNode::new(&self.called_aet, &self.host, self.port)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Model {
    Patient,
    Study,
    PatientStudyOnly,
}

impl Model {
    pub fn find_uid(&self) -> &'static str {
        match self {
            Model::Patient => uids::PATIENT_ROOT_FIND,
            Model::Study => uids::STUDY_ROOT_FIND,
            Model::PatientStudyOnly => uids::PATIENT_STUDY_ONLY_FIND,
        }
    }
}

/// Return keys requested when `find` is given none
fn default_keys(level: QueryLevel) -> &'static [&'static str] {
    match level {
        QueryLevel::Patient => &["PatientName", "PatientID", "PatientBirthDate"],
        QueryLevel::Study => &["PatientName", "PatientID", "StudyDate", "StudyDescription", "StudyInstanceUID"],
        QueryLevel::Series => &["StudyInstanceUID", "SeriesInstanceUID", "SeriesNumber", "Modality"],
        QueryLevel::Image => &["SeriesInstanceUID", "SOPInstanceUID", "InstanceNumber"],
    }
}

/// Build a C-FIND identifier from `Keyword=Value` arguments
pub fn build_identifier(level: QueryLevel, keys: &[String]) -> anyhow::Result<InMemDicomObject> {
    let mut identifier = InMemDicomObject::new_empty();
    identifier.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from(level.to_string()),
    ));

    let defaults: Vec<String> = default_keys(level).iter().map(|k| k.to_string()).collect();
    let keys = if keys.is_empty() { &defaults[..] } else { keys };

    for key in keys {
        let (keyword, value) = key.split_once('=').unwrap_or((key.as_str(), ""));
        // Keyword or (gggg,eeee) tag expression
        let entry = StandardDataDictionary
            .by_expr(keyword.trim())
            .ok_or_else(|| anyhow!("Unknown keyword '{}'", keyword))?;
        identifier.put(DataElement::new(
            entry.tag(),
            entry.vr().relaxed(),
            PrimitiveValue::from(value.trim()),
        ));
    }
    Ok(identifier)
}

fn describe_match(found: &InMemDicomObject) -> String {
    found
        .iter()
        .filter(|elem| elem.header().tag != tags::QUERY_RETRIEVE_LEVEL)
        .map(|elem| {
            let tag = elem.header().tag;
            let name = StandardDataDictionary
                .by_tag(tag)
                .map(|entry| entry.alias().to_string())
                .unwrap_or_else(|| tag.to_string());
            let value = elem.to_str().map(|v| v.trim().to_string()).unwrap_or_default();
            format!("{}={}", name, value)
        })
        .collect::<Vec<_>>()
        .join("  ")
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(aet) = &cli.aet {
        config.node.ae_title = aet.clone();
    }
    crate::init_logging(&config.logging)?;

    match cli.command {
        Commands::Serve { port, output } => {
            if let Some(port) = port {
                config.node.port = port;
            }
            if let Some(output) = output {
                config.storage.path = output;
            }
            crate::serve(config).await?
        }
        Commands::Echo { target, retries } => {
            let node = target.resolve(&config)?;
            let mut scu = DimseScu::new(config.node.clone());
            if retries > 0 {
                if !scu.verify_with_retries(&node, retries).await? {
                    bail!("C-ECHO to {} did not succeed", node.ae_title);
                }
                println!("C-ECHO to {} succeeded", node.ae_title);
            } else {
                let status = scu.echo(&node).await?;
                println!("C-ECHO to {}: {}", node.ae_title, status);
                if !status.is_success() {
                    bail!("C-ECHO returned {}", status);
                }
            }
        }
        Commands::Find {
            target,
            model,
            level,
            keys,
        } => {
            let node = target.resolve(&config)?;
            let identifier = build_identifier(level, &keys)?;
            let mut scu = DimseScu::new(config.node.clone());
            let mut matches = scu.find(&node, model.find_uid(), &identifier).await?;
            let mut count = 0usize;
            while let Some(found) = matches.next().await {
                let found = found?;
                count += 1;
                println!("{:>4}  {}", count, describe_match(&found));
            }
            println!("{} match(es)", count);
        }
        Commands::Retrieve {
            target,
            study,
            series,
            dest_aet,
            output,
            listen_port,
        } => {
            let node = target.resolve(&config)?;
            if let Some(output) = output {
                config.storage.path = output;
            }
            if let Some(port) = listen_port {
                config.node.port = port;
            }
            let identifier = match series {
                Some(series) => MoveIdentifier::series(study, series),
                None => MoveIdentifier::study(study),
            };
            retrieve(config, node, dest_aet, identifier).await?
        }
    }
    Ok(())
}

async fn retrieve(
    config: Config,
    node: RemoteNode,
    dest_aet: Option<String>,
    identifier: MoveIdentifier,
) -> anyhow::Result<()> {
    let storage = FilesystemStorage::new(&config.storage.path)?;
    let local_aet = config.node.ae_title.clone();
    let destination = dest_aet.unwrap_or_else(|| local_aet.clone());

    // The local listener only matters when the data is moved to us
    let listener = if destination == local_aet {
        let registry = ServiceRegistry::builder()
            .register(EchoHandler)?
            .register(StoreHandler::new(std::sync::Arc::new(storage.clone())))?
            .build();
        let listener = AssociationListener::new(config.node.clone(), registry)?;
        let addr = listener
            .start()
            .await
            .context("starting the local storage listener")?;
        tracing::info!("Receiving moved instances as {} on {}", local_aet, addr);
        Some(listener)
    } else {
        None
    };

    let mut scu = DimseScu::new(config.node.clone());
    let result = scu.retrieve(&node, &destination, &identifier, &storage).await;

    if let Some(listener) = listener {
        listener.stop();
        listener.join().await;
    }

    let summary = result?;
    println!(
        "C-MOVE {}: {} completed, {} failed, {} warning(s); {} stored locally",
        summary
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "no final status".to_string()),
        summary.sub_operations.completed,
        summary.sub_operations.failed,
        summary.sub_operations.warning,
        summary.datasets_stored,
    );
    if !summary.is_success() {
        bail!("C-MOVE did not complete successfully");
    }
    Ok(())
}
