//! Ports: nodes with a text-stream surface
//!
//! A port layers a byte-stream interface over the fabric. Every `write`
//! call becomes exactly one `port_data` message broadcast to all
//! connected receivers (and lands in the local buffer, so a port reads
//! back what it wrote); inbound `port_data` appends to the buffer with a
//! newline separating entries. Reads drain the buffer.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::address::Address;
use crate::clock::ScalarTime;
use crate::error::FabricResult;
use crate::node::Node;
use crate::vm::Vm;

/// Stream disposition of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    In,
    Out,
    InOut,
    App,
    Ate,
    Trunc,
    Binary,
}

/// A node with a stream buffer attached
pub struct Port {
    node: Arc<Node>,
    mode: OpenMode,
    buffer: Arc<Mutex<String>>,
}

impl Port {
    /// Create and register a port
    pub fn new(vm: &Arc<Vm>, addr: Address, mode: OpenMode) -> FabricResult<Port> {
        let node = Node::new(vm, addr)?;
        let buffer = Arc::new(Mutex::new(String::new()));

        let sink = Arc::clone(&buffer);
        node.set_data_handler(move |msg| {
            let mut buf = sink.lock().unwrap();
            if buf.is_empty() {
                buf.push_str(&msg.data);
            } else {
                buf.push('\n');
                buf.push_str(&msg.data);
            }
        });

        Ok(Port { node, mode, buffer })
    }

    #[inline]
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn address(&self) -> Address {
        self.node.address()
    }

    pub fn time(&self) -> ScalarTime {
        self.node.time()
    }

    pub fn open_mode(&self) -> OpenMode {
        self.mode
    }

    /// Connect `other` as a receiver of this port's writes
    pub fn connect(&self, other: &Port) -> bool {
        self.node.connect(&other.node)
    }

    pub fn disconnect(&self, other: &Port) -> bool {
        self.node.disconnect(&other.node)
    }

    /// Push one chunk onto the fabric (and the local buffer)
    pub fn put(&self, data: &str) {
        {
            let mut buf = self.buffer.lock().unwrap();
            if buf.is_empty() {
                buf.push_str(data);
            } else {
                buf.push('\n');
                buf.push_str(data);
            }
        }
        self.node.post_data(data);
    }

    /// Drain the whole buffer
    pub fn take(&self) -> String {
        core::mem::take(&mut *self.buffer.lock().unwrap())
    }

    /// Peek at the buffer without consuming it
    pub fn buffered(&self) -> String {
        self.buffer.lock().unwrap().clone()
    }
}

impl Write for Port {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &Port {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = std::str::from_utf8(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.put(text);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for Port {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl Read for &Port {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.buffer.lock().unwrap();
        let bytes = inner.as_bytes();
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        inner.drain(..n);
        Ok(n)
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        // Dropping the registry entry lets the node tear its edges down
        // once the last reference goes away
        if let Some(vm) = self.node.vm() {
            vm.unregister_node(self.node.address());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmConfig;
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    fn test_vm() -> Arc<Vm> {
        Vm::new(VmConfig {
            num_threads: 2,
            port: 0,
            handle_signals: false,
            ..VmConfig::default()
        })
        .unwrap()
    }

    fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        pred()
    }

    #[test]
    fn test_write_reads_back_locally() {
        let vm = test_vm();
        let mut port = Port::new(&vm, Address::new(1, 0, 0, 1), OpenMode::InOut).unwrap();

        port.write_all(b"abc").unwrap();
        port.write_all(b"def").unwrap();
        // Separate writes are separate entries
        assert_eq!(port.buffered(), "abc\ndef");

        let mut out = String::new();
        port.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abc\ndef");
        assert!(port.buffered().is_empty());

        drop(port);
        vm.wait_for_done();
    }

    #[test]
    fn test_each_write_is_one_message() {
        let vm = test_vm();
        let src = Port::new(&vm, Address::new(1, 0, 1, 1), OpenMode::Out).unwrap();
        let dst = Port::new(&vm, Address::new(1, 0, 1, 2), OpenMode::In).unwrap();
        assert!(src.connect(&dst));

        (&src).write_all(b"one").unwrap();
        (&src).write_all(b"two").unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            dst.buffered() == "one\ntwo"
        }));

        drop(src);
        drop(dst);
        vm.wait_for_done();
    }

    #[test]
    fn test_mode_is_just_an_attribute() {
        let vm = test_vm();
        let port = Port::new(&vm, Address::new(1, 0, 2, 1), OpenMode::Ate).unwrap();
        assert_eq!(port.open_mode(), OpenMode::Ate);
        drop(port);
        vm.wait_for_done();
    }

    #[test]
    fn test_dropped_receiver_disappears_from_sender() {
        let vm = test_vm();
        let src = Port::new(&vm, Address::new(1, 0, 3, 1), OpenMode::Out).unwrap();
        let dst = Port::new(&vm, Address::new(1, 0, 3, 2), OpenMode::In).unwrap();
        assert!(src.connect(&dst));
        let dst_key = dst.node().key();

        assert!(wait_until(Duration::from_secs(2), || {
            dst.node().sender_keys().contains(&src.node().key())
        }));

        drop(dst);
        // The next broadcast reaps the cleared edge
        assert!(wait_until(Duration::from_secs(2), || {
            src.put("probe");
            !src.node().receiver_keys().contains(&dst_key)
        }));

        drop(src);
        vm.wait_for_done();
    }
}
