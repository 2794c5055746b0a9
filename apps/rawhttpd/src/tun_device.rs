//! TUN device setup: device creation
//! and address/route configuration are the operator-facing plumbing the
//! core deliberately stays out of; this module is the one concrete
//! `RawIpWriter` the binary hands the core.

use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rawhttpd_core::endpoint::{strip_af_inet_prefix, RawIpWriter};
use rawhttpd_core::error::{CoreError, CoreResult};

/// The write half, shared with every thread that needs to emit a datagram
/// (the reader loop itself, plus any future multi-threaded dispatch). A TUN
/// fd is dup'd rather than mutex-shared where the platform allows it, but a
/// mutex is the portable fallback and writes here are never hot enough to
/// care.
pub struct TunWriter {
    device: Mutex<tun::platform::Device>,
}

impl RawIpWriter for TunWriter {
    fn write_datagram(&self, datagram: &[u8]) -> CoreResult<()> {
        self.device.lock().unwrap().write_all(datagram).map_err(CoreError::from)
    }
}

pub struct TunDevice {
    reader: tun::platform::Device,
    pub writer: Arc<TunWriter>,
}

pub struct TunParams {
    pub name: Option<String>,
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub mtu: i32,
}

/// Brings up the TUN device and splits it into a reader the caller polls in
/// a loop and a cloneable writer the core writes replies through.
pub fn open(params: &TunParams) -> Result<TunDevice> {
    let mut config = tun::Configuration::default();
    config.address(params.local_ip).destination(params.remote_ip).netmask(params.subnet).mtu(params.mtu).up();
    if let Some(name) = &params.name {
        config.name(name);
    }

    #[cfg(target_os = "linux")]
    config.platform(|platform_config| {
        platform_config.packet_information(false);
    });

    let reader = tun::create(&config).context("failed to create TUN device (are you running as root?)")?;
    let writer_device = reader.try_clone().context("failed to clone the TUN device handle for the writer side")?;

    Ok(TunDevice {
        reader,
        writer: Arc::new(TunWriter { device: Mutex::new(writer_device) }),
    })
}

impl TunDevice {
    /// Blocks for the next datagram read off the device, stripping the
    /// 4-byte AF_INET prefix some hosts prepend on read. Never re-added on
    /// write.
    pub fn read_datagram<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a [u8]> {
        let n = self.reader.read(buf).context("TUN device read failed")?;
        Ok(strip_af_inet_prefix(&buf[..n]))
    }
}
