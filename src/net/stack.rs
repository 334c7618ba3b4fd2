use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, info, trace, warn};

use super::device::TunDevice;
use super::ip::{Ipv4Header, IPPROTO_TCP};
use super::tcp::{TcpFlags, TcpHeader, WINDOW_SIZE};

const HOST_READ_BUF: usize = 8192;

/// Reachable connection states. The container is always the active opener,
/// so the active-open states (SYN_SENT, FIN_WAIT, ...) do not exist here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    Closed,
}

/// Four-tuple with the ports swapped as seen from the container, so that
/// replies can be built from the TCB without re-swapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: [u8; 4],
    pub sport: u16,
    pub dst: [u8; 4],
    pub dport: u16,
}

impl FlowKey {
    fn from_segment(ip: &Ipv4Header, tcp: &TcpHeader) -> Self {
        Self {
            src: ip.src,
            sport: tcp.dport,
            dst: ip.dst,
            dport: tcp.sport,
        }
    }
}

/// TCP control block: per-flow state plus the host-side stream halves.
/// TCBs are passive state owned by the stack; transitions are driven from
/// the stack's handlers.
pub struct Tcb {
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    /// Port we answer from; this is the port the container dialed.
    pub src_port: u16,
    /// The container's own (ephemeral) port.
    pub dst_port: u16,

    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u16,
    pub iss: u32,

    pub rcv_nxt: u32,
    pub rcv_wnd: u16,
    pub irs: u32,

    pub state: TcpState,
    host_rx: Option<OwnedReadHalf>,
    host_tx: Option<OwnedWriteHalf>,
}

impl Tcb {
    fn new(ip: &Ipv4Header, tcp: &TcpHeader) -> Self {
        Self {
            src_ip: ip.src,
            dst_ip: ip.dst,
            src_port: tcp.dport,
            dst_port: tcp.sport,
            snd_una: 0,
            // deterministic ISS: the TUN is single-tenant and unreachable
            // externally, so no anti-spoofing randomization is needed
            snd_nxt: 1,
            snd_wnd: WINDOW_SIZE,
            iss: 1,
            rcv_nxt: tcp.seq.wrapping_add(1),
            rcv_wnd: WINDOW_SIZE,
            irs: tcp.seq,
            state: TcpState::Listen,
            host_rx: None,
            host_tx: None,
        }
    }

    fn describe(&self) -> String {
        format!(
            "{}:{} -> {}:{}",
            Ipv4Addr::from(self.src_ip),
            self.dst_port,
            Ipv4Addr::from(self.dst_ip),
            self.src_port,
        )
    }
}

struct StackInner {
    tcbs: HashMap<FlowKey, Tcb>,
    out: mpsc::UnboundedSender<Vec<u8>>,
    decode_errors: u64,
}

impl StackInner {
    /// Build and queue one segment for the flow. The flags are carried here
    /// rather than re-read from the emitted bytes; SYN and FIN consume a
    /// sequence number, payload bytes consume their length.
    fn send_segment(&mut self, key: &FlowKey, flags: u8, payload: &[u8]) {
        let Some(tcb) = self.tcbs.get_mut(key) else {
            return;
        };
        let tcp = TcpHeader {
            sport: tcb.src_port,
            dport: tcb.dst_port,
            seq: tcb.snd_nxt,
            ack: tcb.rcv_nxt,
            flags: TcpFlags(flags),
        };
        let seg = tcp.build(&tcb.dst_ip, &tcb.src_ip, payload);
        let mut pkt = Ipv4Header::new(tcb.dst_ip, tcb.src_ip, IPPROTO_TCP).build(seg.len());
        pkt.extend_from_slice(&seg);
        let _ = self.out.send(pkt);

        tcb.snd_nxt = tcb.snd_nxt.wrapping_add(payload.len() as u32);
        if flags & (TcpFlags::SYN | TcpFlags::FIN) != 0 {
            tcb.snd_nxt = tcb.snd_nxt.wrapping_add(1);
        }
    }
}

/// Userspace TCP endpoint for the container's TUN link. Owns every TCB and
/// re-originates container connections on the host loopback. All state is
/// touched from a single current-thread runtime; packet events for one flow
/// are processed serially in arrival order.
#[derive(Clone)]
pub struct TcpStack {
    inner: Rc<RefCell<StackInner>>,
}

impl TcpStack {
    /// Returns the stack and the receiver carrying outbound IP datagrams.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stack = Self {
            inner: Rc::new(RefCell::new(StackInner {
                tcbs: HashMap::new(),
                out: tx,
                decode_errors: 0,
            })),
        };
        (stack, rx)
    }

    pub fn decode_errors(&self) -> u64 {
        self.inner.borrow().decode_errors
    }

    /// Process one raw datagram read from the TUN device.
    pub async fn handle_frame(&self, frame: &[u8]) {
        // only IPv4; IPv6 from the container is dropped silently
        match frame.first() {
            Some(b) if b >> 4 == 4 => {}
            _ => return,
        }
        let (ip, rest) = match Ipv4Header::parse(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.inner.borrow_mut().decode_errors += 1;
                trace!("dropping frame: {e}");
                return;
            }
        };
        if ip.proto != IPPROTO_TCP {
            return;
        }
        let (tcp, payload) = match TcpHeader::parse(&ip, rest) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.inner.borrow_mut().decode_errors += 1;
                trace!("dropping segment: {e}");
                return;
            }
        };
        self.handle_segment(ip, tcp, payload).await;
    }

    async fn handle_segment(&self, ip: Ipv4Header, tcp: TcpHeader, payload: &[u8]) {
        let key = FlowKey::from_segment(&ip, &tcp);
        let state = {
            let mut inner = self.inner.borrow_mut();
            match inner.tcbs.get(&key) {
                Some(tcb) => tcb.state,
                None => {
                    // only a SYN opens a flow; anything else is dropped
                    // without an RST
                    if !tcp.flags.is_syn() {
                        return;
                    }
                    inner.tcbs.insert(key, Tcb::new(&ip, &tcp));
                    TcpState::Listen
                }
            }
        };

        match state {
            TcpState::Listen => self.on_listen(key, &tcp).await,
            TcpState::SynReceived => self.on_syn_received(key, &tcp),
            TcpState::Established => self.on_established(key, &tcp, payload).await,
            TcpState::CloseWait => self.on_close_wait(key),
            TcpState::LastAck => self.on_last_ack(key, &tcp),
            TcpState::Closed => {}
        }
    }

    async fn on_listen(&self, key: FlowKey, tcp: &TcpHeader) {
        if !tcp.flags.is_syn() {
            return;
        }
        let port = {
            let mut inner = self.inner.borrow_mut();
            let Some(tcb) = inner.tcbs.get_mut(&key) else {
                return;
            };
            tcb.state = TcpState::SynReceived;
            tcb.src_port
        };

        // policy: the container addresses services the host exposes at the
        // port it dialed; the destination address is ignored
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => {
                let (host_rx, host_tx) = stream.into_split();
                let mut inner = self.inner.borrow_mut();
                if let Some(tcb) = inner.tcbs.get_mut(&key) {
                    tcb.host_rx = Some(host_rx);
                    tcb.host_tx = Some(host_tx);
                }
                inner.send_segment(&key, TcpFlags::SYN | TcpFlags::ACK, &[]);
            }
            Err(e) => {
                warn!("host connect to 127.0.0.1:{port} failed: {e}");
                let mut inner = self.inner.borrow_mut();
                inner.send_segment(&key, TcpFlags::FIN | TcpFlags::ACK, &[]);
                if let Some(tcb) = inner.tcbs.get_mut(&key) {
                    tcb.state = TcpState::LastAck;
                }
            }
        }
    }

    fn on_syn_received(&self, key: FlowKey, tcp: &TcpHeader) {
        if !tcp.flags.is_ack() {
            return;
        }
        let host_rx = {
            let mut inner = self.inner.borrow_mut();
            let Some(tcb) = inner.tcbs.get_mut(&key) else {
                return;
            };
            tcb.state = TcpState::Established;
            info!("connection established: {}", tcb.describe());
            tcb.host_rx.take()
        };
        if let Some(host_rx) = host_rx {
            tokio::task::spawn_local(host_reader(self.clone(), key, host_rx));
        }
    }

    async fn on_established(&self, key: FlowKey, tcp: &TcpHeader, payload: &[u8]) {
        if tcp.flags.is_fin() {
            // half-close from the container
            let mut inner = self.inner.borrow_mut();
            if let Some(tcb) = inner.tcbs.get_mut(&key) {
                tcb.state = TcpState::CloseWait;
            }
            inner.send_segment(&key, TcpFlags::ACK, &[]);
            return;
        }
        if !tcp.flags.is_ack() {
            return;
        }
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(tcb) = inner.tcbs.get_mut(&key) {
                tcb.snd_una = tcp.ack;
                tcb.rcv_nxt = tcp.seq.wrapping_add(payload.len() as u32);
            }
            inner.send_segment(&key, TcpFlags::ACK, &[]);
        }
        if payload.is_empty() {
            return;
        }

        // forward to the host side; the write half is taken out of the TCB
        // so no borrow is held across the await
        let host_tx = {
            let mut inner = self.inner.borrow_mut();
            inner.tcbs.get_mut(&key).and_then(|tcb| tcb.host_tx.take())
        };
        let Some(mut host_tx) = host_tx else {
            return;
        };
        let res = async {
            host_tx.write_all(payload).await?;
            host_tx.flush().await
        }
        .await;
        match res {
            Ok(()) => {
                let mut inner = self.inner.borrow_mut();
                if let Some(tcb) = inner.tcbs.get_mut(&key) {
                    tcb.host_tx = Some(host_tx);
                }
            }
            Err(e) => {
                warn!("host write failed: {e}");
                self.close_from_host(&key);
            }
        }
    }

    fn on_close_wait(&self, key: FlowKey) {
        let mut inner = self.inner.borrow_mut();
        inner.send_segment(&key, TcpFlags::FIN | TcpFlags::ACK, &[]);
        if let Some(tcb) = inner.tcbs.get_mut(&key) {
            tcb.state = TcpState::LastAck;
        }
    }

    fn on_last_ack(&self, key: FlowKey, tcp: &TcpHeader) {
        if !tcp.flags.is_ack() {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        if let Some(mut tcb) = inner.tcbs.remove(&key) {
            tcb.state = TcpState::Closed;
            info!("connection closed: {}", tcb.describe());
        }
    }

    /// The host side went away (EOF or error): close our half toward the
    /// container and wait for its final ACK. Other flows are unaffected.
    fn close_from_host(&self, key: &FlowKey) {
        let mut inner = self.inner.borrow_mut();
        inner.send_segment(key, TcpFlags::FIN | TcpFlags::ACK, &[]);
        if let Some(tcb) = inner.tcbs.get_mut(key) {
            tcb.state = TcpState::LastAck;
        }
    }
}

async fn host_reader(stack: TcpStack, key: FlowKey, mut host_rx: OwnedReadHalf) {
    let mut buf = vec![0u8; HOST_READ_BUF];
    loop {
        {
            let inner = stack.inner.borrow();
            match inner.tcbs.get(&key) {
                Some(tcb) if tcb.state == TcpState::Established => {}
                _ => return,
            }
        }
        match host_rx.read(&mut buf).await {
            Ok(0) => {
                debug!("host side closed");
                stack.close_from_host(&key);
                return;
            }
            Ok(n) => {
                let mut inner = stack.inner.borrow_mut();
                // a packet event may have moved the flow on while we slept
                match inner.tcbs.get(&key) {
                    Some(tcb) if tcb.state == TcpState::Established => {}
                    _ => return,
                }
                inner.send_segment(&key, TcpFlags::ACK | TcpFlags::PSH, &buf[..n]);
            }
            Err(e) => {
                warn!("host read failed: {e}");
                stack.close_from_host(&key);
                return;
            }
        }
    }
}

/// Run the stack on its own thread with a current-thread runtime. The
/// runtime owns the TUN fd and every host-side socket, so TCB state never
/// crosses threads.
pub fn start(tun: OwnedFd) -> anyhow::Result<std::thread::JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("tcp-stack".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!("tcp stack runtime: {e}");
                    return;
                }
            };
            let local = LocalSet::new();
            if let Err(e) = local.block_on(&rt, serve(tun)) {
                debug!("tcp stack stopped: {e:#}");
            }
        })?;
    Ok(handle)
}

async fn serve(tun: OwnedFd) -> anyhow::Result<()> {
    let mut device = TunDevice::new(tun)?;
    let mut writer = device.try_clone()?;
    let (stack, mut out_rx) = TcpStack::new();

    tokio::task::spawn_local(async move {
        while let Some(pkt) = out_rx.recv().await {
            if let Err(e) = writer.write_all(&pkt).await {
                debug!("tun write failed: {e}");
                break;
            }
        }
    });

    let mut buf = vec![0u8; 65536];
    loop {
        let n = device.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stack.handle_frame(&buf[..n]).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;

    const CONTAINER_IP: [u8; 4] = [192, 168, 64, 2];
    const STACK_IP: [u8; 4] = [192, 168, 64, 1];
    const CONTAINER_PORT: u16 = 43210;

    fn frame(dport: u16, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        let tcp = TcpHeader {
            sport: CONTAINER_PORT,
            dport,
            seq,
            ack,
            flags: TcpFlags(flags),
        };
        let seg = tcp.build(&CONTAINER_IP, &STACK_IP, payload);
        let mut pkt = Ipv4Header::new(CONTAINER_IP, STACK_IP, IPPROTO_TCP).build(seg.len());
        pkt.extend_from_slice(&seg);
        pkt
    }

    fn key_for(dport: u16) -> FlowKey {
        FlowKey {
            src: CONTAINER_IP,
            sport: dport,
            dst: STACK_IP,
            dport: CONTAINER_PORT,
        }
    }

    fn parse_emitted(pkt: &[u8]) -> (TcpHeader, Vec<u8>) {
        let (ip, rest) = Ipv4Header::parse(pkt).unwrap();
        let (tcp, payload) = TcpHeader::parse(&ip, rest).unwrap();
        (tcp, payload.to_vec())
    }

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn handshake(
        stack: &TcpStack,
        out_rx: &mut UnboundedReceiver<Vec<u8>>,
        listener: &TcpListener,
        port: u16,
    ) -> tokio::net::TcpStream {
        stack.handle_frame(&frame(port, 100, 0, TcpFlags::SYN, &[])).await;
        let (synack, _) = parse_emitted(&out_rx.recv().await.unwrap());
        assert_eq!(synack.flags.0, TcpFlags::SYN | TcpFlags::ACK);
        let (host_conn, _) = listener.accept().await.unwrap();
        stack
            .handle_frame(&frame(port, 101, synack.seq.wrapping_add(1), TcpFlags::ACK, &[]))
            .await;
        host_conn
    }

    #[tokio::test]
    async fn non_syn_creates_no_tcb_and_emits_nothing() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (stack, mut out_rx) = TcpStack::new();
                stack
                    .handle_frame(&frame(8000, 100, 0, TcpFlags::ACK, &[]))
                    .await;
                assert!(stack.inner.borrow().tcbs.is_empty());
                assert!(out_rx.try_recv().is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn syn_creates_tcb_and_answers_syn_ack() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (listener, port) = listener().await;
                let (stack, mut out_rx) = TcpStack::new();

                stack
                    .handle_frame(&frame(port, 456, 0, TcpFlags::SYN, &[]))
                    .await;
                drop(listener);

                let inner = stack.inner.borrow();
                let tcb = inner.tcbs.get(&key_for(port)).expect("tcb created");
                assert_eq!(tcb.irs, 456);
                assert_eq!(tcb.state, TcpState::SynReceived);
                drop(inner);

                let (synack, payload) = parse_emitted(&out_rx.recv().await.unwrap());
                assert_eq!(synack.flags.0, TcpFlags::SYN | TcpFlags::ACK);
                assert_eq!(synack.seq, 1);
                assert_eq!(synack.ack, 457);
                assert!(payload.is_empty());
                assert!(out_rx.try_recv().is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn handshake_establishes_and_proxies_host_data() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (listener, port) = listener().await;
                let (stack, mut out_rx) = TcpStack::new();

                let mut host_conn = handshake(&stack, &mut out_rx, &listener, port).await;
                assert_eq!(
                    stack.inner.borrow().tcbs.get(&key_for(port)).unwrap().state,
                    TcpState::Established
                );

                // host pushes data: expect one ACK+PSH toward the container
                host_conn.write_all(b"hello").await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;

                let (seg, payload) = parse_emitted(&out_rx.recv().await.unwrap());
                assert_eq!(seg.flags.0, TcpFlags::ACK | TcpFlags::PSH);
                assert_eq!(payload, b"hello");
                // snd_nxt advanced past ISS+1 (SYN) by the payload length
                assert_eq!(
                    stack.inner.borrow().tcbs.get(&key_for(port)).unwrap().snd_nxt,
                    2 + 5
                );
            })
            .await;
    }

    #[tokio::test]
    async fn container_payload_is_forwarded_to_host() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (listener, port) = listener().await;
                let (stack, mut out_rx) = TcpStack::new();

                let mut host_conn = handshake(&stack, &mut out_rx, &listener, port).await;

                stack
                    .handle_frame(&frame(port, 101, 2, TcpFlags::ACK | TcpFlags::PSH, b"ping"))
                    .await;

                // bare ACK back to the container, advanced over the payload
                let (seg, payload) = parse_emitted(&out_rx.recv().await.unwrap());
                assert_eq!(seg.flags.0, TcpFlags::ACK);
                assert_eq!(seg.ack, 105);
                assert!(payload.is_empty());

                let mut buf = [0u8; 16];
                let n = host_conn.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"ping");
            })
            .await;
    }

    #[tokio::test]
    async fn bare_ack_is_acknowledged() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (listener, port) = listener().await;
                let (stack, mut out_rx) = TcpStack::new();

                let _host_conn = handshake(&stack, &mut out_rx, &listener, port).await;

                stack
                    .handle_frame(&frame(port, 101, 2, TcpFlags::ACK, &[]))
                    .await;

                let (seg, payload) = parse_emitted(&out_rx.recv().await.unwrap());
                assert_eq!(seg.flags.0, TcpFlags::ACK);
                assert_eq!(seg.ack, 101);
                assert!(payload.is_empty());
                assert_eq!(
                    stack.inner.borrow().tcbs.get(&key_for(port)).unwrap().state,
                    TcpState::Established
                );
            })
            .await;
    }

    #[tokio::test]
    async fn fin_handshake_removes_tcb() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (listener, port) = listener().await;
                let (stack, mut out_rx) = TcpStack::new();

                let _host_conn = handshake(&stack, &mut out_rx, &listener, port).await;
                let key = key_for(port);

                stack
                    .handle_frame(&frame(port, 101, 2, TcpFlags::FIN | TcpFlags::ACK, &[]))
                    .await;
                let (ack, _) = parse_emitted(&out_rx.recv().await.unwrap());
                assert_eq!(ack.flags.0, TcpFlags::ACK);
                assert_eq!(
                    stack.inner.borrow().tcbs.get(&key).unwrap().state,
                    TcpState::CloseWait
                );

                // any segment in CLOSE_WAIT triggers our FIN
                stack
                    .handle_frame(&frame(port, 102, 2, TcpFlags::ACK, &[]))
                    .await;
                let (finack, _) = parse_emitted(&out_rx.recv().await.unwrap());
                assert_eq!(finack.flags.0, TcpFlags::FIN | TcpFlags::ACK);
                assert_eq!(
                    stack.inner.borrow().tcbs.get(&key).unwrap().state,
                    TcpState::LastAck
                );

                // the final ACK garbage-collects the flow
                stack
                    .handle_frame(&frame(port, 102, finack.seq.wrapping_add(1), TcpFlags::ACK, &[]))
                    .await;
                assert!(stack.inner.borrow().tcbs.is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn snd_nxt_is_monotonic_across_segments() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (listener, port) = listener().await;
                let (stack, mut out_rx) = TcpStack::new();

                let mut host_conn = handshake(&stack, &mut out_rx, &listener, port).await;

                let mut last = 0u32;
                for chunk in [&b"one"[..], b"three", b"fifteen"] {
                    host_conn.write_all(chunk).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    let (seg, _) = parse_emitted(&out_rx.recv().await.unwrap());
                    assert!(seg.seq >= last);
                    last = seg.seq;
                }
            })
            .await;
    }

    #[tokio::test]
    async fn malformed_frames_are_counted_and_dropped() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (stack, mut out_rx) = TcpStack::new();

                let mut bad = frame(8000, 1, 0, TcpFlags::SYN, &[]);
                let last = bad.len() - 1;
                bad[last] ^= 0xff; // corrupt TCP checksum
                stack.handle_frame(&bad).await;
                assert_eq!(stack.decode_errors(), 1);

                // non-IPv4 version nibble: dropped silently, not counted
                let mut v6 = frame(8000, 1, 0, TcpFlags::SYN, &[]);
                v6[0] = 0x60;
                stack.handle_frame(&v6).await;
                assert_eq!(stack.decode_errors(), 1);

                assert!(stack.inner.borrow().tcbs.is_empty());
                assert!(out_rx.try_recv().is_err());
            })
            .await;
    }
}
