//! CLI for the basic-block prober
//!
//! # Usage
//!
//! ```bash
//! # Hex-encoded block bytes as the argument (mov rax, [rax])
//! blockprobe 488b00
//!
//! # Raw block bytes on stdin
//! blockprobe - < block.bin
//! ```

use std::io::Read;
use std::{env, process};

use blockprobe::find_accessed_addrs;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <hex-bytes | ->", args[0]);
        process::exit(1);
    }

    let basic_block = if args[1] == "-" {
        let mut bytes = Vec::new();
        if let Err(e) = std::io::stdin().read_to_end(&mut bytes) {
            eprintln!("Failed to read block from stdin: {e}");
            process::exit(1);
        }
        bytes
    } else {
        parse_hex(&args[1]).unwrap_or_else(|e| {
            eprintln!("Failed to parse hex block: {e}");
            process::exit(1);
        })
    };

    let accessed = find_accessed_addrs(&basic_block).unwrap_or_else(|e| {
        eprintln!("Probing failed: {e}");
        process::exit(1);
    });

    println!("Code location: {:#x}", accessed.code_location);
    println!("Block size:    {} bytes", accessed.block_size);
    println!("Accessed blocks: {}", accessed.accessed_blocks.len());
    for block in &accessed.accessed_blocks {
        println!("  {block:#x}");
    }
}

fn parse_hex(input: &str) -> Result<Vec<u8>, String> {
    let digits: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err("odd number of hex digits".into());
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| format!("invalid hex byte {:?}", &digits[i..i + 2]))
        })
        .collect()
}
