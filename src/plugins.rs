//! Built-in plugins and plugin registry
//!
//! A small set of plugins sufficient to compose useful pipelines: file and
//! memory input/output, a null packet generator, a discarding output, a PID
//! filter and a passthrough counter. The registry maps plugin names from the
//! command line to constructors.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::Error;
use crate::metadata::PacketMetadata;
use crate::plugin::{InputPlugin, OutputPlugin, ProcessStatus, ProcessorPlugin};
use crate::ts::{Pid, TsPacket, NULL_PACKET, PKT_SIZE};

/// Create an input plugin by name.
pub fn create_input(name: &str, args: &[String]) -> Result<Box<dyn InputPlugin>> {
    match name {
        "file" => Ok(Box::new(FileInput::new(args)?)),
        "null" => Ok(Box::new(NullInput::new(args)?)),
        "memory" => bail!("memory input must be built programmatically"),
        _ => Err(Error::UnknownPlugin(name.to_string()).into()),
    }
}

/// Create a processor plugin by name.
pub fn create_processor(name: &str, args: &[String]) -> Result<Box<dyn ProcessorPlugin>> {
    match name {
        "filter" => Ok(Box::new(PidFilter::new(args)?)),
        "count" => Ok(Box::new(CountPlugin::default())),
        "merge" => Ok(Box::new(crate::merge::MergePlugin::from_args(args)?)),
        _ => Err(Error::UnknownPlugin(name.to_string()).into()),
    }
}

/// Create an output plugin by name.
pub fn create_output(name: &str, args: &[String]) -> Result<Box<dyn OutputPlugin>> {
    match name {
        "file" => Ok(Box::new(FileOutput::new(args)?)),
        "drop" => Ok(Box::new(DropOutput)),
        "memory" => bail!("memory output must be built programmatically"),
        _ => Err(Error::UnknownPlugin(name.to_string()).into()),
    }
}

//----------------------------------------------------------------------------
// file input / output
//----------------------------------------------------------------------------

/// Reads TS packets from a binary file.
pub struct FileInput {
    path: String,
    file: Option<BufReader<File>>,
}

impl FileInput {
    pub fn new(args: &[String]) -> Result<Self> {
        let path = args
            .first()
            .ok_or_else(|| Error::Config("file input: missing file name".into()))?;
        Ok(Self {
            path: path.clone(),
            file: None,
        })
    }
}

impl InputPlugin for FileInput {
    fn name(&self) -> &str {
        "file"
    }

    fn start(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("cannot open input file {}", self.path))?;
        self.file = Some(BufReader::new(file));
        debug!(path = %self.path, "input file open");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn receive(&mut self, pkts: &mut [TsPacket], _meta: &mut [PacketMetadata]) -> Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        let mut count = 0;
        for pkt in pkts.iter_mut() {
            let mut buf = [0u8; PKT_SIZE];
            let mut filled = 0;
            // Read one full packet, tolerating short reads.
            while filled < PKT_SIZE {
                let n = file.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            if filled < PKT_SIZE {
                bail!("truncated TS packet at end of file {}", self.path);
            }
            pkt.b = buf;
            count += 1;
        }
        Ok(count)
    }
}

/// Writes TS packets to a binary file.
pub struct FileOutput {
    path: String,
    file: Option<BufWriter<File>>,
}

impl FileOutput {
    pub fn new(args: &[String]) -> Result<Self> {
        let path = args
            .first()
            .ok_or_else(|| Error::Config("file output: missing file name".into()))?;
        Ok(Self {
            path: path.clone(),
            file: None,
        })
    }
}

impl OutputPlugin for FileOutput {
    fn name(&self) -> &str {
        "file"
    }

    fn start(&mut self) -> Result<()> {
        let file = File::create(&self.path)
            .with_context(|| format!("cannot create output file {}", self.path))?;
        self.file = Some(BufWriter::new(file));
        debug!(path = %self.path, "output file open");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    fn send(&mut self, pkts: &[TsPacket], _meta: &[PacketMetadata]) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            bail!("output file not open");
        };
        for pkt in pkts {
            file.write_all(&pkt.b)?;
        }
        Ok(())
    }
}

//----------------------------------------------------------------------------
// null input / drop output
//----------------------------------------------------------------------------

/// Generates null packets, optionally a bounded number of them.
pub struct NullInput {
    remaining: Option<u64>,
}

impl NullInput {
    pub fn new(args: &[String]) -> Result<Self> {
        let remaining = match args.first() {
            None => None,
            Some(v) => Some(
                v.parse::<u64>()
                    .map_err(|_| Error::Config(format!("null input: invalid count '{v}'")))?,
            ),
        };
        Ok(Self { remaining })
    }
}

impl InputPlugin for NullInput {
    fn name(&self) -> &str {
        "null"
    }

    fn receive(&mut self, pkts: &mut [TsPacket], _meta: &mut [PacketMetadata]) -> Result<usize> {
        let max = match self.remaining {
            Some(0) => return Ok(0),
            Some(n) => (n as usize).min(pkts.len()),
            None => pkts.len(),
        };
        for pkt in &mut pkts[..max] {
            *pkt = NULL_PACKET;
        }
        if let Some(n) = &mut self.remaining {
            *n -= max as u64;
        }
        Ok(max)
    }
}

/// Discards everything.
pub struct DropOutput;

impl OutputPlugin for DropOutput {
    fn name(&self) -> &str {
        "drop"
    }

    fn send(&mut self, _pkts: &[TsPacket], _meta: &[PacketMetadata]) -> Result<()> {
        Ok(())
    }
}

//----------------------------------------------------------------------------
// memory input / output
//----------------------------------------------------------------------------

/// Reads packets from a shared in-memory vector. Built programmatically, used
/// by embedding applications and tests.
pub struct MemoryInput {
    packets: Arc<Vec<TsPacket>>,
    position: usize,
    /// Cap on packets returned per receive call (0 = no cap).
    chunk: usize,
}

impl MemoryInput {
    pub fn new(packets: Arc<Vec<TsPacket>>) -> Self {
        Self {
            packets,
            position: 0,
            chunk: 0,
        }
    }

    pub fn with_chunk(packets: Arc<Vec<TsPacket>>, chunk: usize) -> Self {
        Self {
            packets,
            position: 0,
            chunk,
        }
    }
}

impl InputPlugin for MemoryInput {
    fn name(&self) -> &str {
        "memory"
    }

    fn receive(&mut self, pkts: &mut [TsPacket], _meta: &mut [PacketMetadata]) -> Result<usize> {
        let remaining = self.packets.len() - self.position;
        let mut count = remaining.min(pkts.len());
        if self.chunk > 0 {
            count = count.min(self.chunk);
        }
        pkts[..count].copy_from_slice(&self.packets[self.position..self.position + count]);
        self.position += count;
        Ok(count)
    }
}

/// Collects packets into a shared in-memory vector.
pub struct MemoryOutput {
    packets: Arc<Mutex<Vec<TsPacket>>>,
}

impl MemoryOutput {
    pub fn new(packets: Arc<Mutex<Vec<TsPacket>>>) -> Self {
        Self { packets }
    }
}

impl OutputPlugin for MemoryOutput {
    fn name(&self) -> &str {
        "memory"
    }

    fn send(&mut self, pkts: &[TsPacket], _meta: &[PacketMetadata]) -> Result<()> {
        self.packets.lock().extend_from_slice(pkts);
        Ok(())
    }
}

//----------------------------------------------------------------------------
// filter processor
//----------------------------------------------------------------------------

/// Drops packets belonging to a set of PIDs.
pub struct PidFilter {
    pids: HashSet<Pid>,
}

impl PidFilter {
    pub fn new(args: &[String]) -> Result<Self> {
        let mut pids = HashSet::new();
        for arg in args {
            let value = arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X"));
            let pid = match value {
                Some(hex) => Pid::from_str_radix(hex, 16),
                None => arg.parse::<Pid>(),
            }
            .map_err(|_| Error::Config(format!("filter: invalid PID '{arg}'")))?;
            pids.insert(pid & 0x1FFF);
        }
        if pids.is_empty() {
            return Err(Error::Config("filter: no PID specified".into()).into());
        }
        Ok(Self { pids })
    }

    pub fn with_pids(pids: impl IntoIterator<Item = Pid>) -> Self {
        Self {
            pids: pids.into_iter().collect(),
        }
    }
}

impl ProcessorPlugin for PidFilter {
    fn name(&self) -> &str {
        "filter"
    }

    fn process_packet(&mut self, pkt: &mut TsPacket, _meta: &mut PacketMetadata) -> ProcessStatus {
        if self.pids.contains(&pkt.pid()) {
            ProcessStatus::Drop
        } else {
            ProcessStatus::Ok
        }
    }
}

//----------------------------------------------------------------------------
// count processor
//----------------------------------------------------------------------------

/// Passthrough packet counter, reported at stop time.
#[derive(Default)]
pub struct CountPlugin {
    total: u64,
    null: u64,
}

impl ProcessorPlugin for CountPlugin {
    fn name(&self) -> &str {
        "count"
    }

    fn stop(&mut self) -> Result<()> {
        info!(total = self.total, null = self.null, "count plugin summary");
        Ok(())
    }

    fn process_packet(&mut self, pkt: &mut TsPacket, _meta: &mut PacketMetadata) -> ProcessStatus {
        self.total += 1;
        if pkt.is_null() {
            self.null += 1;
        }
        ProcessStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_unknown_plugin() {
        assert!(create_input("nonexistent", &[]).is_err());
        assert!(create_processor("nonexistent", &[]).is_err());
        assert!(create_output("nonexistent", &[]).is_err());
    }

    #[test]
    fn test_pid_filter_parsing() {
        let f = PidFilter::new(&["0x100".to_string(), "512".to_string()]).unwrap();
        assert!(f.pids.contains(&0x100));
        assert!(f.pids.contains(&512));
        assert!(PidFilter::new(&[]).is_err());
        assert!(PidFilter::new(&["zzz".to_string()]).is_err());
    }

    #[test]
    fn test_memory_roundtrip() {
        let mut src = Vec::new();
        for i in 0..100u16 {
            let mut pkt = NULL_PACKET;
            pkt.set_pid(i);
            src.push(pkt);
        }
        let mut input = MemoryInput::new(Arc::new(src.clone()));
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut output = MemoryOutput::new(sink.clone());

        let mut buf = vec![NULL_PACKET; 7];
        let mut meta = vec![PacketMetadata::default(); 7];
        loop {
            let n = input.receive(&mut buf, &mut meta).unwrap();
            if n == 0 {
                break;
            }
            output.send(&buf[..n], &meta[..n]).unwrap();
        }
        assert_eq!(*sink.lock(), src);
    }

    #[test]
    fn test_null_input_bounded() {
        let mut input = NullInput::new(&["5".to_string()]).unwrap();
        let mut buf = vec![TsPacket::default(); 3];
        let mut meta = vec![PacketMetadata::default(); 3];
        assert_eq!(input.receive(&mut buf, &mut meta).unwrap(), 3);
        assert_eq!(input.receive(&mut buf, &mut meta).unwrap(), 2);
        assert_eq!(input.receive(&mut buf, &mut meta).unwrap(), 0);
    }
}
