use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub(crate) listen: IpAddr,
    /// (TCP) port for the control protocol.
    #[arg(short, long, default_value_t = 11400)]
    pub(crate) port: u16,
    /// YAML file of tuning knobs. Built-in defaults apply without one.
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,
    /// Directory that original and generated images are written to.
    #[arg(short, long, default_value = "blobs")]
    pub(crate) blob_dir: PathBuf,
    /// URL under which the blob directory is publicly served.
    #[arg(short = 'u', long, default_value = "http://127.0.0.1:8080")]
    pub(crate) public_base_url: String,
    /// File that created items are appended to, one JSON object per line.
    #[arg(short, long, default_value = "items.jsonl")]
    pub(crate) records_file: PathBuf,
    /// Overrides the maximum accepted image size, in bytes.
    #[arg(short = 'z', long)]
    pub(crate) max_image_size: Option<usize>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}
