use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Metadata database url
    #[arg(
        long,
        env = "VSTORE_DATABASE_URL",
        default_value = "sqlite:///var/lib/vstore/vstore.db"
    )]
    pub database_url: String,

    /// Root directory of the filesystem zone (zone 1)
    #[arg(long, env = "VSTORE_ROOTDIR", default_value = "/var/lib/vstore")]
    pub root: String,

    /// Public base url for redirect downloads from the filesystem zone
    #[arg(long, env = "VSTORE_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Bucket of the S3 zone (zone 2); the zone is disabled when unset
    #[arg(long, env = "VSTORE_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Custom S3 endpoint, e.g. a MinIO server
    #[arg(long, env = "VSTORE_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, env = "VSTORE_S3_REGION", default_value = "us-east-1")]
    pub s3_region: String,

    /// Storage zone receiving new uploads
    #[arg(long, env = "VSTORE_DEFAULT_ZONE", default_value_t = 1)]
    pub default_zone: i64,

    /// Default listing page size
    #[arg(long, env = "VSTORE_PAGE_SIZE", default_value_t = 100)]
    pub page_size: u32,

    /// Concurrent blob copies during a folder copy
    #[arg(long, env = "VSTORE_COPY_CONCURRENCY", default_value_t = 4)]
    pub copy_concurrency: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "Create a top-level folder")]
    Mkroot {
        name: String,
        #[arg(long, default_value = "admin")]
        owner: String,
    },
    #[command(about = "Create a folder inside an existing folder")]
    Mkdir {
        #[arg(value_name = "PARENT")]
        parent: String,
        name: String,
        #[arg(long, default_value = "admin")]
        owner: String,
    },
    #[command(about = "Upload a local file, optionally in chunks")]
    Put {
        #[arg(value_name = "LOCAL_FILE")]
        local: String,
        #[arg(value_name = "PATH")]
        path: String,
        #[arg(long, default_value_t = 8 * 1024 * 1024)]
        chunk_size: u64,
        #[arg(long, default_value = "admin")]
        owner: String,
    },
    #[command(about = "Attach a sidecar artifact to a file")]
    Sidecar {
        path: String,
        tag: String,
        #[arg(value_name = "LOCAL_FILE")]
        local: String,
    },
    #[command(about = "List a folder")]
    Ls {
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long)]
        recursive: bool,
        #[arg(long)]
        cursor: Option<String>,
        #[arg(long, default_value = "name")]
        sort_by: String,
        #[arg(long)]
        desc: bool,
        #[arg(long)]
        limit: Option<u32>,
    },
    #[command(about = "Show a single entry")]
    Info { path: String },
    #[command(about = "Move an entry")]
    Mv {
        src: String,
        dst: String,
        #[arg(long)]
        merge: bool,
    },
    #[command(about = "Copy an entry recursively")]
    Cp { src: String, dst: String },
    #[command(about = "Delete an entry")]
    Rm { path: String },
    #[command(about = "Download a file into a local file")]
    Get {
        path: String,
        #[arg(value_name = "LOCAL_FILE")]
        output: String,
        /// Id of a historical version
        #[arg(long)]
        version: Option<i64>,
    },
    #[command(about = "List the historical versions of a file")]
    Versions { path: String },
    #[command(about = "Show folder totals")]
    Du {
        #[arg(default_value = "/")]
        path: String,
    },
}
