//! The VM runtime
//!
//! A [`Vm`] owns one worker thread pool (priority scheduler), one reactor
//! pool pumped by the network threads, one TCP acceptor, the edge arena
//! and the node registry. Inbound messages are dispatched to the owning
//! node's handler as priority-1 tasks on that node's strand.
//!
//! There is no process-wide singleton: the VM is a handle threaded
//! through node constructors, with a process-current slot for code that
//! cannot pass it explicitly.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use gridvm_core::pool::{ExecutionService, ThreadPool};
use gridvm_core::sched::SchedulerKind;
use gridvm_core::strand::Strand;

use crate::address::Address;
use crate::edge::EdgeArena;
use crate::error::{FabricError, FabricResult};
use crate::message::Message;
use crate::node::Node;
use crate::reactor::{Reactor, ReactorPool};
use crate::session::Session;

/// Signal-driven shutdown request, shared by every VM in the process
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Whether a termination signal has been delivered
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

extern "C" fn handle_termination(_signo: libc::c_int) {
    // Async-signal-safe: a single atomic store
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(unix)]
fn install_signal_handlers() -> FabricResult<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(handle_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGQUIT,
        Signal::SIGABRT,
    ] {
        // Safety: the handler only performs an atomic store
        unsafe { sigaction(signal, &action) }
            .map_err(|e| FabricError::SignalSetup(e as i32))?;
    }
    Ok(())
}

/// Construction parameters of a VM
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub cluster: i32,
    pub num_threads: usize,
    pub num_network_threads: usize,
    pub num_reactors: usize,
    pub host: String,
    pub port: u16,
    pub max_edges: usize,
    pub handle_signals: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            cluster: 0,
            num_threads: 1,
            num_network_threads: 1,
            num_reactors: 1,
            host: "127.0.0.1".into(),
            port: 55699,
            max_edges: 65_536,
            handle_signals: true,
        }
    }
}

struct Registry {
    by_addr: HashMap<Address, Arc<Node>>,
    by_key: HashMap<u32, (Address, Weak<Node>)>,
    next_key: u32,
}

/// The runtime: pools, acceptor, registry
pub struct Vm {
    cluster: i32,
    pool: Arc<ThreadPool>,
    reactors: Arc<ReactorPool>,
    arena: EdgeArena,
    registry: Mutex<Registry>,
    stop_all: Arc<AtomicBool>,
    net_threads: Mutex<Vec<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

/// Process-current VM for code that cannot be handed the Arc
static CURRENT_VM: Mutex<Option<Weak<Vm>>> = Mutex::new(None);

impl Vm {
    /// Build and start a VM: worker pool, reactor pool, network threads
    /// and a listening acceptor
    pub fn new(config: VmConfig) -> FabricResult<Arc<Vm>> {
        if config.num_reactors == 0 {
            return Err(FabricError::BadConfig("num_reactors must be at least 1"));
        }
        if config.num_network_threads == 0 {
            return Err(FabricError::BadConfig(
                "num_network_threads must be at least 1",
            ));
        }

        if config.handle_signals {
            #[cfg(unix)]
            install_signal_handlers()?;
        }

        let listener = bind_listener(&config.host, config.port)?;
        let local_addr = listener.local_addr()?;

        let vm = Arc::new(Vm {
            cluster: config.cluster,
            pool: Arc::new(ThreadPool::new(SchedulerKind::Prio, config.num_threads)),
            reactors: Arc::new(ReactorPool::new(config.num_reactors)),
            arena: EdgeArena::new(config.max_edges),
            registry: Mutex::new(Registry {
                by_addr: HashMap::new(),
                by_key: HashMap::new(),
                next_key: 0,
            }),
            stop_all: Arc::new(AtomicBool::new(false)),
            net_threads: Mutex::new(Vec::new()),
            local_addr,
        });

        // The acceptor is itself a self-re-posting reactor job
        let accept_reactor = vm.reactors.next_reactor();
        let listener = Arc::new(listener);
        {
            let weak = Arc::downgrade(&vm);
            let reactor = accept_reactor.clone();
            accept_reactor.post(Box::new(move || accept_pump(weak, listener, reactor)));
        }

        // Network threads pump reactors round-robin until told to stop
        {
            let mut threads = vm.net_threads.lock().unwrap();
            for index in 0..config.num_network_threads {
                let reactors = Arc::clone(&vm.reactors);
                let stop = Arc::clone(&vm.stop_all);
                let handle = std::thread::Builder::new()
                    .name(format!("gridvm-net-{}", index))
                    .spawn(move || {
                        while !stop.load(Ordering::Acquire) {
                            let reactor = reactors.next_reactor();
                            reactor.run_one(Duration::from_millis(100));
                        }
                    })
                    .map_err(FabricError::Io)?;
                threads.push(handle);
            }
        }

        Vm::make_current(&vm);
        tracing::info!(cluster = config.cluster, addr = %local_addr, "vm started");
        Ok(vm)
    }

    /// Make `vm` the process-current VM
    pub fn make_current(vm: &Arc<Vm>) {
        *CURRENT_VM.lock().unwrap() = Some(Arc::downgrade(vm));
    }

    /// The process-current VM, when one is alive
    pub fn current() -> Option<Arc<Vm>> {
        CURRENT_VM.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    #[inline]
    pub fn cluster(&self) -> i32 {
        self.cluster
    }

    /// Address the acceptor actually bound (relevant with port 0)
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// The executor used for message dispatch
    pub fn executor(&self) -> Arc<dyn ExecutionService> {
        Arc::clone(&self.pool) as Arc<dyn ExecutionService>
    }

    pub(crate) fn arena(&self) -> &EdgeArena {
        &self.arena
    }

    /// Register a node under `addr`, allocating its key and strand
    pub(crate) fn register_node<F>(self: &Arc<Self>, addr: Address, make: F) -> FabricResult<Arc<Node>>
    where
        F: FnOnce(u32, Strand) -> Arc<Node>,
    {
        let mut registry = self.registry.lock().unwrap();
        if registry.by_addr.contains_key(&addr) {
            return Err(FabricError::AddressInUse(addr));
        }
        let key = registry.next_key;
        registry.next_key += 1;

        let node = make(key, Strand::new(self.executor()));
        registry.by_addr.insert(addr, Arc::clone(&node));
        registry.by_key.insert(key, (addr, Arc::downgrade(&node)));
        Ok(node)
    }

    /// Drop the registry entry for `addr`; the node tears its edges down
    /// when the last reference goes away
    pub fn unregister_node(&self, addr: Address) {
        let node = {
            let mut registry = self.registry.lock().unwrap();
            let node = registry.by_addr.remove(&addr);
            if let Some(node) = &node {
                registry.by_key.remove(&node.key());
            }
            node
        };
        // Dropped outside the lock: the node's teardown resolves peer
        // addresses through this registry
        drop(node);
    }

    /// Node registered under `addr`, if any
    pub fn resolve(&self, addr: Address) -> Option<Arc<Node>> {
        self.registry.lock().unwrap().by_addr.get(&addr).cloned()
    }

    /// Node behind a registry key, if still alive
    pub fn resolve_key(&self, key: u32) -> Option<Arc<Node>> {
        self.registry
            .lock()
            .unwrap()
            .by_key
            .get(&key)
            .and_then(|(_, weak)| weak.upgrade())
    }

    /// Address behind a registry key
    pub(crate) fn address_of(&self, key: u32) -> Option<Address> {
        self.registry.lock().unwrap().by_key.get(&key).map(|(a, _)| *a)
    }

    /// Dispatch `msg` to the receiving node's handler on its strand
    pub fn post_message(&self, msg: Message) {
        match self.resolve(msg.receiver) {
            Some(node) => node.deliver(msg),
            None => {
                tracing::trace!(receiver = %msg.receiver, "message for unknown node dropped");
            }
        }
    }

    /// Pump one job of the next reactor
    pub fn loop_once(&self) -> bool {
        self.reactors.next_reactor().run_one(Duration::ZERO)
    }

    fn initiate_stop(&self) {
        if self.stop_all.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("vm stopping");
        self.reactors.stop();
    }

    /// Stop networking, join the network threads and drain the pool
    pub fn wait_for_done(&self) {
        self.initiate_stop();
        let threads = core::mem::take(&mut *self.net_threads.lock().unwrap());
        for handle in threads {
            let _ = handle.join();
        }
        self.pool.wait_for_done(-1);
    }

    pub fn stopping(&self) -> bool {
        self.stop_all.load(Ordering::Acquire)
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.initiate_stop();
        let threads = core::mem::take(&mut *self.net_threads.lock().unwrap());
        for handle in threads {
            let _ = handle.join();
        }
    }
}

/// Bind a reusable, non-blocking IPv4 listener
fn bind_listener(host: &str, port: u16) -> FabricResult<TcpListener> {
    let ip: Ipv4Addr = host.parse().map_err(|_| {
        FabricError::BadConfig("address must be an IPv4 address literal")
    })?;

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    unsafe {
        let opt: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { core::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = u32::from(ip).to_be();
    addr.sin_port = port.to_be();

    let bound = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            core::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if bound != 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err.into());
    }

    if unsafe { libc::listen(fd, 1024) } != 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err.into());
    }

    // Safety: fd is a freshly bound, listening socket we own
    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Self-re-posting acceptor job
fn accept_pump(vm: Weak<Vm>, listener: Arc<TcpListener>, reactor: Reactor) {
    let Some(vm_ref) = vm.upgrade() else {
        return;
    };

    if shutdown_requested() {
        vm_ref.initiate_stop();
    }
    if vm_ref.stopping() {
        return;
    }

    let mut pollfd = libc::pollfd {
        fd: listener.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let ready = unsafe { libc::poll(&mut pollfd, 1, 100) };

    if ready > 0 && pollfd.revents & libc::POLLIN != 0 {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "connection accepted");
                    Session::spawn(
                        stream,
                        vm_ref.reactors.next_reactor(),
                        Arc::clone(&vm_ref.stop_all),
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    drop(vm_ref);
    let next = reactor.clone();
    reactor.post(Box::new(move || accept_pump(vm, listener, next)));
}
