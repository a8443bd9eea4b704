//! # Environment Configuration
//!
//! The RDMA core has no command-line entry point of its own — the CLI /
//! library shim that embeds it is an external collaborator (spec.md §1).
//! What it does own is the set of environment variables that control
//! protocol behavior, listed in spec.md §6. This module loads and
//! validates them into a single typed [`RdmaConfig`], the way the
//! teacher's `cli::Args` is parsed and then narrowed into
//! `BenchmarkConfiguration` — except the source here is `std::env` rather
//! than `clap`, and the output is consumed directly by the protocol
//! modules instead of a benchmark runner.

use std::env;
use std::str::FromStr;

use crate::error::TransportError;

/// Selects the wire protocol. Only `Rdma` is implemented by this crate;
/// `Sendrecv` is the external single-rail collaborator named in spec.md §1
/// and is accepted here only so that callers can detect the selection and
/// route to that collaborator themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Sendrecv,
    Rdma,
}

impl FromStr for Protocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sendrecv" => Ok(Protocol::Sendrecv),
            "rdma" => Ok(Protocol::Rdma),
            other => Err(TransportError::InvalidArgument(format!(
                "unrecognized protocol {other:?} (expected \"sendrecv\" or \"rdma\")"
            ))),
        }
    }
}

/// Validated configuration for the RDMA transport core, loaded once per
/// process from the `OFI_NCCL_*` environment variables named in spec.md §6.
#[derive(Debug, Clone, PartialEq)]
pub struct RdmaConfig {
    pub protocol: Protocol,
    pub eager_max_size: usize,
    pub round_robin_threshold: usize,
    pub min_posted_bounce_buffers: u32,
    pub max_posted_bounce_buffers: u32,
    pub cq_read_count: usize,
    pub mr_key_size: u8,
    pub nic_dup_conns: u32,
    pub net_latency_us: f64,
    pub gdr_flush_disable: bool,
    pub cuda_flush_enable: bool,
    pub topo_file_write_enable: bool,
    pub topo_file_template: Option<String>,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Rdma,
            eager_max_size: 8192,
            round_robin_threshold: 131_072,
            min_posted_bounce_buffers: 64,
            max_posted_bounce_buffers: 128,
            cq_read_count: 4,
            mr_key_size: 2,
            nic_dup_conns: 0,
            net_latency_us: 0.0,
            gdr_flush_disable: false,
            cuda_flush_enable: false,
            topo_file_write_enable: false,
            topo_file_template: None,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(name: &str, default: T) -> Result<T, TransportError>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| TransportError::InvalidArgument(format!("{name}={raw:?}: {e}"))),
    }
}

fn parse_bool_env(name: &str, default: bool) -> Result<bool, TransportError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => match raw.as_str() {
            "1" | "true" | "TRUE" | "yes" => Ok(true),
            "0" | "false" | "FALSE" | "no" => Ok(false),
            other => Err(TransportError::InvalidArgument(format!(
                "{name}={other:?}: expected a boolean"
            ))),
        },
    }
}

impl RdmaConfig {
    /// Load configuration from the process environment, applying the
    /// validation rules in spec.md §6 (e.g. `eager_max_size <=
    /// round_robin_threshold`). Unset variables take the defaults listed
    /// in `SPEC_FULL.md`.
    pub fn from_env() -> Result<Self, TransportError> {
        let defaults = Self::default();

        let protocol = match env_var("OFI_NCCL_PROTOCOL") {
            Some(raw) => raw.parse()?,
            None => defaults.protocol,
        };

        let eager_max_size = parse_env("OFI_NCCL_EAGER_MAX_SIZE", defaults.eager_max_size)?;
        let round_robin_threshold = parse_env(
            "OFI_NCCL_ROUND_ROBIN_THRESHOLD",
            defaults.round_robin_threshold,
        )?;
        let min_posted_bounce_buffers = parse_env(
            "OFI_NCCL_MIN_POSTED_BOUNCE_BUFFERS",
            defaults.min_posted_bounce_buffers,
        )?;
        let max_posted_bounce_buffers = parse_env(
            "OFI_NCCL_MAX_POSTED_BOUNCE_BUFFERS",
            defaults.max_posted_bounce_buffers,
        )?;
        let cq_read_count = parse_env("OFI_NCCL_CQ_READ_COUNT", defaults.cq_read_count)?;
        let mr_key_size = parse_env("OFI_NCCL_MR_KEY_SIZE", defaults.mr_key_size)?;
        let nic_dup_conns = parse_env("OFI_NCCL_NIC_DUP_CONNS", defaults.nic_dup_conns)?;
        let net_latency_us = parse_env("OFI_NCCL_NET_LATENCY", defaults.net_latency_us)?;
        let gdr_flush_disable =
            parse_bool_env("OFI_NCCL_GDR_FLUSH_DISABLE", defaults.gdr_flush_disable)?;
        let cuda_flush_enable =
            parse_bool_env("OFI_NCCL_CUDA_FLUSH_ENABLE", defaults.cuda_flush_enable)?;
        let topo_file_write_enable = parse_bool_env(
            "OFI_NCCL_TOPO_FILE_WRITE_ENABLE",
            defaults.topo_file_write_enable,
        )?;
        let topo_file_template = env_var("OFI_NCCL_TOPO_FILE_TEMPLATE");

        let cfg = Self {
            protocol,
            eager_max_size,
            round_robin_threshold,
            min_posted_bounce_buffers,
            max_posted_bounce_buffers,
            cq_read_count,
            mr_key_size,
            nic_dup_conns,
            net_latency_us,
            gdr_flush_disable,
            cuda_flush_enable,
            topo_file_write_enable,
            topo_file_template,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), TransportError> {
        if self.eager_max_size > self.round_robin_threshold {
            return Err(TransportError::InvalidArgument(format!(
                "eager_max_size ({}) must be <= round_robin_threshold ({})",
                self.eager_max_size, self.round_robin_threshold
            )));
        }
        if self.min_posted_bounce_buffers > self.max_posted_bounce_buffers {
            return Err(TransportError::InvalidArgument(format!(
                "min_posted_bounce_buffers ({}) must be <= max_posted_bounce_buffers ({})",
                self.min_posted_bounce_buffers, self.max_posted_bounce_buffers
            )));
        }
        if self.cq_read_count == 0 {
            return Err(TransportError::InvalidArgument(
                "cq_read_count must be >= 1".into(),
            ));
        }
        if !(1..=4).contains(&self.mr_key_size) {
            return Err(TransportError::InvalidArgument(
                "mr_key_size must be in 1..=4 bytes".into(),
            ));
        }
        if self.net_latency_us < 0.0 {
            return Err(TransportError::InvalidArgument(
                "net_latency_us must be >= 0".into(),
            ));
        }
        Ok(())
    }

    /// Per-rail bounce-buffer bounds, per spec.md §4.3:
    /// `min = ceil(min_global / n)`, `max` likewise.
    pub fn per_rail_bounce_bounds(&self, num_rails: u32) -> (u32, u32) {
        let n = num_rails.max(1);
        let ceil_div = |a: u32, b: u32| a.div_ceil(b);
        (
            ceil_div(self.min_posted_bounce_buffers, n),
            ceil_div(self.max_posted_bounce_buffers, n),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        RdmaConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_eager_larger_than_threshold() {
        let mut cfg = RdmaConfig::default();
        cfg.eager_max_size = cfg.round_robin_threshold + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_bounce_bounds() {
        let mut cfg = RdmaConfig::default();
        cfg.min_posted_bounce_buffers = cfg.max_posted_bounce_buffers + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn per_rail_bounds_ceil_divide() {
        let cfg = RdmaConfig {
            min_posted_bounce_buffers: 10,
            max_posted_bounce_buffers: 21,
            ..RdmaConfig::default()
        };
        assert_eq!(cfg.per_rail_bounce_bounds(4), (3, 6));
    }

    #[test]
    fn protocol_parses_case_insensitively() {
        assert_eq!("RDMA".parse::<Protocol>().unwrap(), Protocol::Rdma);
        assert_eq!("sendrecv".parse::<Protocol>().unwrap(), Protocol::Sendrecv);
        assert!("quic".parse::<Protocol>().is_err());
    }
}
