//! Cidr command: print the blocks a range decomposes into.

use anyhow::Result;
use std::net::IpAddr;

use crate::cidr::{count_ips, decompose_with_floor};

pub fn run(from: &str, to: &str, max_prefix_len: Option<u8>) -> Result<()> {
    let (lines, summary) = render(from, to, max_prefix_len)?;
    for line in lines {
        println!("{}", line);
    }
    eprintln!("{}", summary);
    Ok(())
}

/// Block lines plus a one-line summary.
fn render(from: &str, to: &str, max_prefix_len: Option<u8>) -> Result<(Vec<String>, String)> {
    let from: IpAddr = from
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid IP address: {}", from))?;
    let to: IpAddr = to
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid IP address: {}", to))?;

    let floor = max_prefix_len.unwrap_or(if from.is_ipv4() { 32 } else { 128 });
    let (blocks, skipped) = decompose_with_floor(from, to, floor);
    if blocks.is_empty() && skipped == 0 {
        anyhow::bail!(
            "{} - {} cannot be decomposed (inverted bounds, mixed families or an IPv6 range)",
            from,
            to
        );
    }

    let mut summary = format!("{} block(s), {} address(es)", blocks.len(), count_ips(&blocks));
    if skipped > 0 {
        summary.push_str(&format!(", {} block(s) longer than /{} skipped", skipped, floor));
    }
    Ok((blocks.iter().map(ToString::to_string).collect(), summary))
}
