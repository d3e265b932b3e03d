//! rvtap CLI: encode and decode tag-policy wire records.
//!
//! Guests install policies as three 64-bit operand words; this tool converts
//! between that packed form and readable JSON so policy sets can be authored,
//! reviewed, and compared offline.

use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rvtap_engine::{builtin, Policy};

/// rvtap: tag-policy wire-format tool
#[derive(Parser)]
#[command(name = "rvtap")]
#[command(version = "0.1.0")]
#[command(about = "Encode and decode tag-policy wire records", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a JSON policy file into wire words
    Encode {
        /// Path to a JSON file holding a policy or an array of policies
        #[arg(long, value_name = "PATH")]
        file: PathBuf,
    },

    /// Decode wire words (three hex words per policy) into JSON
    Decode {
        /// Words as hex strings, e.g. 0x0000000000000103
        #[arg(value_name = "WORD", num_args = 3..)]
        words: Vec<String>,
    },

    /// Print the built-in return-integrity policy set with its encodings
    Builtins,
}

fn parse_word(raw: &str) -> Result<u64, std::num::ParseIntError> {
    let trimmed = raw.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(trimmed, 16)
}

fn print_encoded(policy: &Policy) {
    let [a, b, c] = policy.to_words();
    println!("{:#018x} {:#018x} {:#018x}", a, b, c);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Encode { file } => {
            let raw = match fs::read_to_string(&file) {
                Ok(raw) => raw,
                Err(e) => {
                    eprintln!("Error reading {}: {}", file.display(), e);
                    std::process::exit(1);
                }
            };
            // Accept either a single policy object or an array.
            let policies: Vec<Policy> = match serde_json::from_str::<Vec<Policy>>(&raw) {
                Ok(policies) => policies,
                Err(_) => match serde_json::from_str::<Policy>(&raw) {
                    Ok(policy) => vec![policy],
                    Err(e) => {
                        eprintln!("Error parsing {}: {}", file.display(), e);
                        std::process::exit(1);
                    }
                },
            };
            for policy in &policies {
                print_encoded(policy);
            }
        }

        Commands::Decode { words } => {
            if words.len() % 3 != 0 {
                eprintln!("Expected groups of three words, got {}", words.len());
                std::process::exit(1);
            }
            let mut decoded = Vec::new();
            for group in words.chunks(3) {
                let mut triple = [0u64; 3];
                for (slot, raw) in triple.iter_mut().zip(group) {
                    *slot = match parse_word(raw) {
                        Ok(word) => word,
                        Err(e) => {
                            eprintln!("Error parsing word {:?}: {}", raw, e);
                            std::process::exit(1);
                        }
                    };
                }
                decoded.push(Policy::from_words(triple));
            }
            match serde_json::to_string_pretty(&decoded) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error rendering JSON: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Builtins => {
            for policy in builtin::return_integrity_set() {
                match serde_json::to_string(&policy) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("Error rendering JSON: {}", e);
                        std::process::exit(1);
                    }
                }
                print_encoded(&policy);
            }
        }
    }
}
