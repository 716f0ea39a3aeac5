use anyhow::Result;
use serde::Serialize;

use kiln_lib::config::EngineConfig;
use kiln_lib::platform::ImagePlatform;

use crate::output::{OutputFormat, print_json, print_stat};

#[derive(Serialize)]
struct Info {
  version: &'static str,
  platform: String,
  root: String,
  snapshots: String,
  cache: String,
  images: String,
  registry: String,
  parallelism: usize,
}

pub fn cmd_info(config: &EngineConfig, output: OutputFormat) -> Result<()> {
  let paths = config.paths();
  let info = Info {
    version: env!("CARGO_PKG_VERSION"),
    platform: ImagePlatform::host().to_string(),
    root: paths.root.display().to_string(),
    snapshots: paths.snapshots().display().to_string(),
    cache: paths.cache().display().to_string(),
    images: paths.images().display().to_string(),
    registry: paths.registry().display().to_string(),
    parallelism: config.parallelism,
  };

  if output.is_json() {
    return print_json(&info);
  }

  println!("kiln {}", info.version);
  print_stat("Platform", &info.platform);
  print_stat("Root", &info.root);
  print_stat("Snapshots", &info.snapshots);
  print_stat("Cache", &info.cache);
  print_stat("Images", &info.images);
  print_stat("Registry", &info.registry);
  print_stat("Parallelism", &info.parallelism.to_string());
  Ok(())
}
