//! `clipgate stats` – slot, proxy, queue and user quota usage.
//!
//! Reads the snapshot the running scheduler publishes. Without one (no
//! `clipgate run` active), reports from a fresh in-process state.

use std::collections::BTreeMap;

use anyhow::Result;
use clipgate_core::admission::UserQuotaSnapshot;
use clipgate_core::stats::{default_stats_path, read_stats_file, SystemStats};
use clipgate_core::Gateway;

pub async fn run_stats(gw: &Gateway, json: bool) -> Result<()> {
    let published = match default_stats_path() {
        Ok(path) => read_stats_file(&path).unwrap_or_else(|e| {
            tracing::warn!("ignoring stats file: {:#}", e);
            None
        }),
        Err(_) => None,
    };
    // Queue depth and rate windows come from the database, which also sees
    // submissions made after the snapshot was published.
    let live = gw.system_stats().await?;
    let stats = match published {
        Some(mut stats) => {
            stats.queue = live.queue;
            stats.users = merge_users(stats.users, live.users);
            stats
        }
        None => live,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_summary(&stats);
    }
    Ok(())
}

/// Running jobs from the published snapshot, the tighter rate window of the two.
fn merge_users(
    published: Vec<UserQuotaSnapshot>,
    live: Vec<UserQuotaSnapshot>,
) -> Vec<UserQuotaSnapshot> {
    let mut users: BTreeMap<String, UserQuotaSnapshot> = published
        .into_iter()
        .map(|u| (u.user_id.clone(), u))
        .collect();
    for l in live {
        match users.get_mut(&l.user_id) {
            Some(u) if l.rate_limit_remaining < u.rate_limit_remaining => {
                u.rate_limit_remaining = l.rate_limit_remaining;
                u.window_resets_in_secs = l.window_resets_in_secs;
            }
            Some(_) => {}
            None => {
                users.insert(l.user_id.clone(), l);
            }
        }
    }
    users.into_values().collect()
}

fn print_summary(stats: &SystemStats) {
    let q = &stats.queue;
    println!(
        "Queue: {} waiting, {} active, {} completed, {} failed",
        q.waiting, q.active, q.completed, q.failed
    );

    println!("\n{:<14} {:>5} {:>5} {:>6}", "PLATFORM", "USED", "MAX", "UTIL");
    for p in &stats.platforms {
        println!(
            "{:<14} {:>5} {:>5} {:>5.0}%",
            p.platform.as_str(),
            p.slots_used,
            p.max_slots,
            p.utilization * 100.0
        );
    }

    let pool = &stats.proxies;
    println!(
        "\nProxies: {} total, {} healthy, {} quarantined, {} in use",
        pool.total, pool.healthy, pool.quarantined, pool.in_use
    );
    for proxy in &stats.proxy_details {
        let state = match proxy.quarantined_for_secs {
            Some(secs) => format!("quarantined {secs}s"),
            None if proxy.healthy => "healthy".to_string(),
            None => "unhealthy".to_string(),
        };
        println!(
            "  {:<12} {:<18} fails={} in_flight={}",
            proxy.id, state, proxy.consecutive_failures, proxy.in_flight
        );
    }

    if !stats.users.is_empty() {
        println!("\n{:<16} {:>6} {:>10} {:>8}", "USER", "ACTIVE", "REMAINING", "RESET");
        for u in &stats.users {
            println!(
                "{:<16} {:>6} {:>10} {:>7}s",
                u.user_id, u.active_jobs, u.rate_limit_remaining, u.window_resets_in_secs
            );
        }
    }
}
