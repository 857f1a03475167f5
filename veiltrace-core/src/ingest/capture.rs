use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use pcap_parser::pcapng::Block;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{create_reader, Linktype, PcapBlockOwned, PcapError};

use crate::error::{PipelineError, Result};

/// Legacy magic numbers carrying nanosecond timestamps, in both byte orders.
const NSEC_MAGIC: u32 = 0xa1b2_3c4d;
const NSEC_MAGIC_SWAPPED: u32 = 0x4d3c_b2a1;

/// pcapng option code for the per-interface timestamp resolution.
const IF_TSRESOL: u16 = 9;

const READ_BUFFER_SIZE: usize = 65536;

/// One captured packet, decoupled from the container format.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    /// Capture timestamp in seconds since the epoch.
    pub timestamp: f64,
    /// On-wire length, which may exceed the captured length.
    pub wire_len: u32,
    /// Captured bytes, starting at the link layer.
    pub data: Vec<u8>,
}

/// Streaming reader over a capture file. Both the legacy container and the
/// next-generation framed variant are accepted; the format is detected from
/// the leading magic. Only Ethernet link layers are supported.
pub struct CaptureReader {
    reader: Box<dyn PcapReaderIterator>,
    meta: CaptureMeta,
    stalled: bool,
}

impl fmt::Debug for CaptureReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureReader")
            .field("interfaces", &self.meta.interfaces.len())
            .finish()
    }
}

impl CaptureReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            PipelineError::Input(format!(
                "cannot open capture {}: {e}",
                path.display()
            ))
        })?;
        Self::from_read(file)
    }

    pub fn from_read<R: Read + Send + 'static>(input: R) -> Result<Self> {
        let reader =
            create_reader(READ_BUFFER_SIZE, input).map_err(|e| {
                PipelineError::Input(format!("unrecognised capture: {e:?}"))
            })?;

        Ok(CaptureReader {
            reader,
            meta: CaptureMeta::default(),
            stalled: false,
        })
    }

    /// Produce the next packet, skipping over non-packet blocks. Returns
    /// `None` at end of input.
    pub fn next_packet(&mut self) -> Result<Option<PacketRecord>> {
        loop {
            let (offset, record) = match self.reader.next() {
                Ok((offset, block)) => {
                    self.stalled = false;
                    (offset, self.meta.process_block(&block)?)
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    if self.stalled {
                        return Err(PipelineError::Input(
                            "truncated capture: trailing partial block"
                                .to_string(),
                        ));
                    }
                    self.stalled = true;
                    self.reader.refill().map_err(|e| {
                        PipelineError::Input(format!(
                            "capture read failed: {e:?}"
                        ))
                    })?;
                    continue;
                }
                Err(e) => {
                    return Err(PipelineError::Input(format!(
                        "malformed capture block: {e:?}"
                    )));
                }
            };

            self.reader.consume(offset);
            if let Some(record) = record {
                return Ok(Some(record));
            }
        }
    }
}

/// Per-capture state needed to interpret packet blocks: the legacy
/// timestamp resolution and, for pcapng, the interface table.
#[derive(Debug)]
struct CaptureMeta {
    legacy_ts_divisor: f64,
    interfaces: Vec<InterfaceMeta>,
}

#[derive(Debug, Clone, Copy)]
struct InterfaceMeta {
    ticks_per_second: f64,
}

impl Default for CaptureMeta {
    fn default() -> Self {
        CaptureMeta {
            legacy_ts_divisor: 1_000_000.0,
            interfaces: Vec::new(),
        }
    }
}

impl CaptureMeta {
    fn process_block(
        &mut self,
        block: &PcapBlockOwned<'_>,
    ) -> Result<Option<PacketRecord>> {
        match block {
            PcapBlockOwned::LegacyHeader(header) => {
                require_ethernet(header.network)?;
                if matches!(
                    header.magic_number,
                    NSEC_MAGIC | NSEC_MAGIC_SWAPPED
                ) {
                    self.legacy_ts_divisor = 1_000_000_000.0;
                }
                Ok(None)
            }
            PcapBlockOwned::Legacy(packet) => {
                let timestamp = packet.ts_sec as f64
                    + packet.ts_usec as f64 / self.legacy_ts_divisor;
                Ok(Some(PacketRecord {
                    timestamp,
                    wire_len: packet.origlen,
                    data: truncated(packet.data, packet.caplen),
                }))
            }
            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                self.interfaces.clear();
                Ok(None)
            }
            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                require_ethernet(idb.linktype)?;
                let resolution = idb
                    .options
                    .iter()
                    .find(|opt| opt.code.0 == IF_TSRESOL)
                    .and_then(|opt| opt.value.first().copied());
                self.interfaces.push(InterfaceMeta {
                    ticks_per_second: ticks_per_second(resolution),
                });
                Ok(None)
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                let interface = self
                    .interfaces
                    .get(epb.if_id as usize)
                    .ok_or_else(|| {
                        PipelineError::Input(format!(
                            "packet references undeclared interface {}",
                            epb.if_id
                        ))
                    })?;
                let ticks =
                    ((epb.ts_high as u64) << 32) | epb.ts_low as u64;
                let timestamp = ticks as f64 / interface.ticks_per_second;
                Ok(Some(PacketRecord {
                    timestamp,
                    wire_len: epb.origlen,
                    data: truncated(epb.data, epb.caplen),
                }))
            }
            PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                // Simple packet blocks carry no timestamp.
                Ok(Some(PacketRecord {
                    timestamp: 0.0,
                    wire_len: spb.origlen,
                    data: truncated(spb.data, spb.origlen),
                }))
            }
            PcapBlockOwned::NG(_) => Ok(None),
        }
    }
}

fn require_ethernet(linktype: Linktype) -> Result<()> {
    if linktype != Linktype::ETHERNET {
        return Err(PipelineError::Input(format!(
            "unsupported link type {linktype:?}: only Ethernet captures are accepted"
        )));
    }
    Ok(())
}

/// Block data may carry alignment padding past the captured length.
fn truncated(data: &[u8], caplen: u32) -> Vec<u8> {
    let len = (caplen as usize).min(data.len());
    data[..len].to_vec()
}

/// Decode an `if_tsresol` option byte: the high bit selects a base-2
/// exponent, otherwise base-10. Absent option means microseconds.
fn ticks_per_second(resolution: Option<u8>) -> f64 {
    match resolution {
        None => 1_000_000.0,
        Some(v) if v & 0x80 != 0 => 2f64.powi((v & 0x7f) as i32),
        Some(v) => 10f64.powi(v as i32),
    }
}
