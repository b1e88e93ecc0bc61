use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;
use vstore::config::{S3Settings, StorageConfig, ZoneConfig, ZoneDriver};
use vstore::domain::{FsEntry, ListOptions};
use vstore::storage::{DownloadDescriptor, DownloadKind};
use vstore::utils::cli::{Args, Command};
use vstore::utils::path::split;
use vstore::StorageService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = validate_config(&args).await;
    tokio::fs::create_dir_all(&config.temp_dir).await?;

    let service = StorageService::from_config(&config).await?;
    run(&service, &config, args.command).await
}

async fn run(service: &StorageService, config: &StorageConfig, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Mkroot { name, owner } => {
            let id = service.create_root(&name, &owner).await?;
            println!("{id}");
        }
        Command::Mkdir {
            parent,
            name,
            owner,
        } => {
            let id = service.create_folder(&parent, &name, &owner).await?;
            println!("{id}");
        }
        Command::Put {
            local,
            path,
            chunk_size,
            owner,
        } => put(service, &config.temp_dir, &local, &path, chunk_size, &owner).await?,
        Command::Sidecar { path, tag, local } => {
            let sidecar = service.upload_sidecar(&path, &tag, Path::new(&local)).await?;
            println!("{}\t{}\t{}", sidecar.file.meta.id, sidecar.metadata_tag, sidecar.file.size);
        }
        Command::Ls {
            path,
            recursive,
            cursor,
            sort_by,
            desc,
            limit,
        } => {
            let options = ListOptions {
                cursor,
                recursive,
                sort_by,
                desc,
                limit_after: limit,
                ..Default::default()
            };
            for entry in service.list(&path, options).await? {
                println!("{}", describe(&entry));
            }
        }
        Command::Info { path } => {
            let entry = service.info(&path).await?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Command::Mv { src, dst, merge } => service.move_entry(&src, &dst, merge).await?,
        Command::Cp { src, dst } => service.copy(&src, &dst).await?,
        Command::Rm { path } => service.delete(&path, false).await?,
        Command::Get {
            path,
            output,
            version,
        } => match service.download(&path, version, DownloadKind::Local).await? {
            DownloadDescriptor::Local { file, size, .. } => {
                tokio::fs::copy(&file, &output).await?;
                println!("{size} bytes written to {output}");
            }
            other => anyhow::bail!("unexpected {} download", other.kind()),
        },
        Command::Versions { path } => {
            for entry in service.versions(&path).await? {
                println!("{}", describe(&entry));
            }
        }
        Command::Du { path } => {
            let props = service.folder_properties(&path).await?;
            println!(
                "{} files\t{} folders\t{} bytes",
                props.file_count, props.folder_count, props.total_size
            );
        }
    }
    Ok(())
}

/// Upload `local` as consecutive chunks of at most `chunk_size` bytes.
async fn put(
    service: &StorageService,
    temp_dir: &Path,
    local: &str,
    path: &str,
    chunk_size: u64,
    owner: &str,
) -> anyhow::Result<()> {
    let (parent, name) = split(path)?;
    let total = tokio::fs::metadata(local).await?.len();
    let chunk_size = chunk_size.max(1);
    let mut source = tokio::fs::File::open(local).await?;
    let mut offset = 0u64;
    loop {
        let mut buf = Vec::new();
        (&mut source).take(chunk_size).read_to_end(&mut buf).await?;
        let final_chunk = offset + buf.len() as u64 >= total;
        let chunk = tempfile::NamedTempFile::new_in(temp_dir)?;
        tokio::fs::write(chunk.path(), &buf).await?;

        let done = service
            .upload_file(&parent, &name, chunk.path(), offset, final_chunk, owner)
            .await?;
        offset += buf.len() as u64;
        if let Some(file) = done {
            println!("{}\t{}\t{} bytes", file.meta.id, file.meta.path, file.size);
            return Ok(());
        }
        if buf.is_empty() {
            anyhow::bail!("{local} ended before {total} bytes were read");
        }
    }
}

fn describe(entry: &FsEntry) -> String {
    match entry {
        FsEntry::Folder(f) => format!("d\t{}\t-\t{}", f.meta.id, f.meta.path),
        FsEntry::File(f) => {
            let state = match (f.is_complete(), f.versioned_on) {
                (false, _) => "uploading".to_string(),
                (true, Some(at)) => at.to_rfc3339(),
                (true, None) => f.meta.updated_on.to_rfc3339(),
            };
            format!("f\t{}\t{}\t{}\t{}", f.meta.id, f.size, f.meta.path, state)
        }
        FsEntry::Sidecar(s) => format!(
            "s\t{}\t{}\t{}#{}",
            s.file.meta.id, s.file.size, s.file.meta.path, s.metadata_tag
        ),
    }
}

fn sqlite_file(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") {
        return None;
    }
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let file = rest.split('?').next().unwrap_or(rest);
    Some(PathBuf::from(file))
}

async fn validate_config(args: &Args) -> StorageConfig {
    let mut validation_errors = Vec::new();

    let root_dir = Path::new(&args.root);
    match tokio::fs::metadata(root_dir).await {
        Ok(meta) => {
            if !meta.is_dir() {
                validation_errors.push(format!(
                    "VSTORE_ROOTDIR `{}` exists but is not a directory",
                    args.root,
                ));
            }
        }
        Err(_) => validation_errors.push(format!("VSTORE_ROOTDIR `{}` does not exist.", args.root)),
    }

    match sqlite_file(&args.database_url) {
        Some(file) => {
            if let Some(parent) = file.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    validation_errors.push(format!(
                        "The directory for the database `{}` does not exist",
                        parent.display(),
                    ));
                }
            }
        }
        None if !args.database_url.contains(":memory:") => validation_errors.push(format!(
            "VSTORE_DATABASE_URL `{}` is not a sqlite url",
            args.database_url
        )),
        None => {}
    }

    if args.page_size == 0 {
        validation_errors.push("VSTORE_PAGE_SIZE must be positive".to_string());
    }
    if args.copy_concurrency == 0 {
        validation_errors.push("VSTORE_COPY_CONCURRENCY must be positive".to_string());
    }

    let mut zones = vec![ZoneConfig {
        id: 1,
        driver: ZoneDriver::Filesystem {
            root: root_dir.to_path_buf(),
            public_base_url: args.public_url.clone(),
        },
    }];
    if let Some(bucket) = &args.s3_bucket {
        let mut settings = S3Settings::new(bucket.clone());
        settings.endpoint = args.s3_endpoint.clone();
        settings.region = args.s3_region.clone();
        zones.push(ZoneConfig {
            id: 2,
            driver: ZoneDriver::S3(settings),
        });
    }
    if !zones.iter().any(|z| z.id == args.default_zone) {
        validation_errors.push(format!(
            "VSTORE_DEFAULT_ZONE {} is not configured (zone 2 needs VSTORE_S3_BUCKET)",
            args.default_zone
        ));
    }

    if !validation_errors.is_empty() {
        eprintln!("{}", validation_errors.join("\n"));
        std::process::exit(1);
    }

    StorageConfig {
        database_url: args.database_url.clone(),
        default_zone: args.default_zone,
        zones,
        list_page_size: args.page_size,
        copy_concurrency: args.copy_concurrency,
        temp_dir: root_dir.join("tmp"),
        ..StorageConfig::local(root_dir, args.database_url.clone())
    }
}
