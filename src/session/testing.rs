//! Test helpers for sessions and the processes they start.

use async_trait::async_trait;
use std::time::Duration;

use super::factory::{SessionFactory, ShellSessionFactory};
use super::shell::PrivilegedSession;
use crate::config::ShellConfig;
use crate::error::BridgeResult;

/// Unprivileged factory whose sessions report a failed close
pub struct FailingCloseFactory {
    inner: ShellSessionFactory,
}

impl Default for FailingCloseFactory {
    fn default() -> Self {
        Self {
            inner: ShellSessionFactory::new(ShellConfig::unprivileged()),
        }
    }
}

#[async_trait]
impl SessionFactory for FailingCloseFactory {
    async fn open(&self) -> BridgeResult<PrivilegedSession> {
        Ok(self.inner.open().await?.failing_close())
    }

    fn describe(&self) -> String {
        format!("{} (failing close)", self.inner.describe())
    }
}

/// Processes of `group` that have not exited. Zombies count as exited.
pub fn live_group_members(group: u32) -> usize {
    let group = group.to_string();
    std::fs::read_dir("/proc")
        .unwrap()
        .filter_map(Result::ok)
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter(|stat| {
            // pid (comm) state ppid pgrp ...
            let Some((_, rest)) = stat.rsplit_once(')') else {
                return false;
            };
            let fields: Vec<&str> = rest.split_whitespace().collect();
            fields.len() > 2 && fields[2] == group && !matches!(fields[0], "Z" | "X")
        })
        .count()
}

/// Wait up to two seconds for every process of `group` to exit
pub async fn group_exited(group: u32) -> bool {
    for _ in 0..40 {
        if live_group_members(group) == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
