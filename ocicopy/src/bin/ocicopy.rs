use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use oci_spec::{
    distribution::Reference,
    image::{Arch, Os, Platform, PlatformBuilder},
};
use serde::Deserialize;

use ocicopy::{
    copy::{CopyOptions, copy},
    ocidir::OciDir,
    ocidist::{Auth, AuthMap, Client},
};

#[derive(Deserialize)]
struct AuthEntry {
    username: String,
    password: String,
}

type StoredAuth = BTreeMap<String, AuthEntry>;

fn load_stored_auth(p: impl AsRef<Path>) -> AuthMap {
    let stored: StoredAuth = serde_json::from_str(&std::fs::read_to_string(p).unwrap()).unwrap();
    stored
        .into_iter()
        .map(|(k, v)| (k, Auth::UserPass(v.username, v.password)))
        .collect()
}

fn parse_platform(s: &str) -> Platform {
    let (os, arch) = s.split_once('/').expect("platform must look like linux/amd64");
    let os = match os {
        "linux" => Os::Linux,
        other => panic!("unhandled os {other}"),
    };
    let arch = match arch {
        "amd64" => Arch::Amd64,
        "arm64" => Arch::ARM64,
        other => panic!("unhandled arch {other}"),
    };
    PlatformBuilder::default()
        .os(os)
        .architecture(arch)
        .build()
        .unwrap()
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Source reference, e.g. ghcr.io/org/thing:v1
    image_ref: String,

    /// Destination OCI layout directory
    dest: PathBuf,

    #[arg(long)]
    platform: Option<String>,

    #[arg(long, default_value_t = 3)]
    concurrency: usize,

    #[arg(long)]
    referrers: bool,

    #[arg(long)]
    plain_http: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let args = Args::parse();

    let reference: Reference = args.image_ref.parse().unwrap();

    let auth = if let Some(path) = std::env::var_os("OCICOPY_AUTH") {
        load_stored_auth(path)
    } else {
        BTreeMap::new()
    };

    let mut builder = Client::builder().auth(auth);
    if args.plain_http {
        builder = builder.plain_http(reference.resolve_registry());
    }
    let client = builder.build().unwrap();
    let repository = client.repository(&args.image_ref).unwrap();

    let dest = OciDir::open_or_create(&args.dest).await.unwrap();

    let src_ref = reference
        .digest()
        .or(reference.tag())
        .expect("reference has neither tag nor digest");
    let dst_ref = reference.tag().unwrap_or("");

    let options = CopyOptions {
        concurrency: args.concurrency,
        platform: args.platform.as_deref().map(parse_platform),
        with_referrers: args.referrers,
        ..CopyOptions::default()
    };

    let root = copy(repository, src_ref, dest, dst_ref, options)
        .await
        .unwrap();
    println!(
        "copied {} -> {} ({})",
        args.image_ref,
        args.dest.display(),
        root.digest()
    );
}
