//! Build script for rfiber-runtime
//!
//! Generates `OUT_DIR/rfb_merged_config.rs` with the compile-time defaults
//! of `SchedulerConfig`. If `RFB_CONFIG_RS` points at a file of
//! `pub const NAME: TYPE = VALUE;` lines, those values replace the
//! library defaults. Unknown names are reported as build warnings.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// Configuration parameter definition
struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

/// All configuration parameters with their defaults
const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "NUM_GROUPS",
        rust_type: "usize",
        default_value: "1",
    },
    ConfigParam {
        name: "WORKERS_PER_GROUP",
        rust_type: "usize",
        default_value: "4",
    },
    ConfigParam {
        name: "RUN_QUEUE_CAPACITY",
        rust_type: "usize",
        default_value: "4096",
    },
    ConfigParam {
        name: "STACK_SIZE",
        rust_type: "usize",
        default_value: "128 * 1024",
    },
    ConfigParam {
        name: "STACK_POOL_CAPACITY",
        rust_type: "usize",
        default_value: "1024",
    },
    ConfigParam {
        name: "IDLE_SPINS",
        rust_type: "u32",
        default_value: "64",
    },
    ConfigParam {
        name: "PARK_TIMEOUT_MS",
        rust_type: "u64",
        default_value: "100",
    },
    ConfigParam {
        name: "CROSS_GROUP_STEALING",
        rust_type: "bool",
        default_value: "true",
    },
    ConfigParam {
        name: "DEBUG_LOGGING",
        rust_type: "bool",
        default_value: "false",
    },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("rfb_merged_config.rs");

    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    if let Ok(user_path) = env::var("RFB_CONFIG_RS") {
        println!("cargo:rerun-if-changed={}", user_path);
        match fs::read_to_string(&user_path) {
            Ok(content) => {
                parse_and_merge(&content, &mut config);
                println!("cargo:warning=Using custom config: {}", user_path);
            }
            Err(e) => {
                println!(
                    "cargo:warning=Failed to read RFB_CONFIG_RS ({}): {}",
                    user_path, e
                );
            }
        }
    }

    println!("cargo:rerun-if-env-changed=RFB_CONFIG_RS");

    let output = generate_config(&config);
    fs::write(&dest_path, &output).expect("Failed to write merged config");
}

/// Merge `pub const NAME: TYPE = VALUE;` lines over the defaults
///
/// One constant per line. Comments and anything that is not a
/// `pub const` line are skipped.
fn parse_and_merge(content: &str, config: &mut HashMap<&str, String>) {
    let consts = content
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("pub const "));

    for line in consts {
        if let Some((name, value)) = parse_const_line(line) {
            match CONFIG_PARAMS.iter().find(|p| p.name == name) {
                Some(param) => {
                    config.insert(param.name, value);
                }
                None => println!("cargo:warning=Unknown config parameter: {}", name),
            }
        }
    }
}

/// Split `pub const NAME: TYPE = VALUE;` into `(NAME, VALUE)`
fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();
    let (name, rest) = rest.split_once(':')?;
    let (_ty, value) = rest.split_once('=')?;
    let value = value.trim().trim_end_matches(';').trim();
    Some((name.trim().to_string(), value.to_string()))
}

fn generate_config(config: &HashMap<&str, String>) -> String {
    let mut output = String::from("// Generated by rfiber-runtime/build.rs\n");
    if let Ok(path) = env::var("RFB_CONFIG_RS") {
        output.push_str(&format!("// Overrides from {}\n", path));
    }
    output.push('\n');

    for param in CONFIG_PARAMS {
        output.push_str(&format!(
            "pub const {}: {} = {};\n",
            param.name, param.rust_type, config[param.name]
        ));
    }
    output
}
