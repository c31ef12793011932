//! Build script for costack-runtime
//!
//! Merges compile-time configuration:
//! 1. Start with library defaults
//! 2. If COSTACK_CONFIG_RS is set, parse that file
//! 3. User values override defaults
//! 4. Write OUT_DIR/costack_merged_config.rs
//!
//! The user file only lists the values it changes, e.g.
//!
//! ```text
//! pub const STACK_SIZE: usize = 256 * 1024;
//! pub const CONNECT_TIMEOUT_MS: u64 = 1500;
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "POLL_TIMEOUT_MS",
        rust_type: "u64",
        default_value: "10",
    },
    ConfigParam {
        name: "IDLE_TIMEOUT_MS",
        rust_type: "u64",
        default_value: "100",
    },
    ConfigParam {
        name: "IDLE_TURNS",
        rust_type: "u32",
        default_value: "100",
    },
    ConfigParam {
        name: "INITIAL_EPOLL_EVENTS",
        rust_type: "usize",
        default_value: "64",
    },
    ConfigParam {
        name: "STACK_SIZE",
        rust_type: "usize",
        default_value: "1024 * 1024", // 1MB
    },
    ConfigParam {
        name: "BUFFER_SIZE",
        rust_type: "usize",
        default_value: "64 * 1024",
    },
    ConfigParam {
        name: "MAX_BUFFER_SIZE",
        rust_type: "usize",
        default_value: "1024 * 1024",
    },
    ConfigParam {
        name: "CONNECT_TIMEOUT_MS",
        rust_type: "u64",
        default_value: "5000",
    },
    ConfigParam {
        name: "RECONNECT_INTERVAL_MS",
        rust_type: "u64",
        default_value: "1000",
    },
    ConfigParam {
        name: "LISTEN_BACKLOG",
        rust_type: "i32",
        default_value: "1024",
    },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("costack_merged_config.rs");

    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    if let Ok(user_path) = env::var("COSTACK_CONFIG_RS") {
        println!("cargo:rerun-if-changed={}", user_path);

        match fs::read_to_string(&user_path) {
            Ok(content) => {
                for unknown in parse_and_merge(&content, &mut config) {
                    println!("cargo:warning=Unknown config parameter: {}", unknown);
                }
                println!("cargo:warning=Using custom config: {}", user_path);
            }
            Err(e) => {
                println!(
                    "cargo:warning=Failed to read COSTACK_CONFIG_RS ({}): {}",
                    user_path, e
                );
            }
        }
    }

    println!("cargo:rerun-if-env-changed=COSTACK_CONFIG_RS");

    let output = generate_config(&config);
    fs::write(&dest_path, &output).expect("Failed to write merged config");
}

/// Merge `pub const NAME: TYPE = VALUE;` lines into `config`
///
/// Returns the names that are not known parameters.
fn parse_and_merge(content: &str, config: &mut HashMap<&str, String>) -> Vec<String> {
    let mut unknown = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if !line.starts_with("pub const ") {
            continue;
        }
        let Some((name, value)) = parse_const_line(line) else {
            continue;
        };
        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => unknown.push(name),
        }
    }
    unknown
}

/// Parse `pub const NAME: TYPE = VALUE;` into (NAME, VALUE)
fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();

    let colon_pos = rest.find(':')?;
    let name = rest[..colon_pos].trim().to_string();

    let eq_pos = rest.find('=')?;
    let semi_pos = rest.rfind(';').unwrap_or(rest.len());
    let value = rest[eq_pos + 1..semi_pos].trim().to_string();

    Some((name, value))
}

fn generate_config(config: &HashMap<&str, String>) -> String {
    let mut output = String::new();

    output.push_str("// Auto-generated by build.rs - do not edit\n");
    output.push_str("// Configuration merged from library defaults");
    if env::var("COSTACK_CONFIG_RS").is_ok() {
        output.push_str(" and COSTACK_CONFIG_RS");
    }
    output.push_str("\n\n");

    for param in CONFIG_PARAMS {
        let value = config
            .get(param.name)
            .map(String::as_str)
            .unwrap_or(param.default_value);
        output.push_str(&format!(
            "pub const {}: {} = {};\n",
            param.name, param.rust_type, value
        ));
    }

    output
}
