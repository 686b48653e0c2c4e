//! The public façade (spec.md §6.4, SPEC_FULL.md §4.9): [`Server`] and
//! [`Stream`] wrap a shared [`Host`] the way the original's `server`/`stream`
//! classes wrap a `shared_ptr<host>` (`include/sss/server.h`, `include/stream.h`)
//! — one `Host` underlies every service an application registers and every
//! connection it makes, reference-counted rather than singleton because nothing
//! here requires there be only one per process (spec.md §5 explicitly allows
//! several `Host`s in one process).
//!
//! Neither type owns any protocol state of its own: every method borrows the
//! shared `Host` just long enough to delegate, mirroring how thin the teacher's
//! own public surface is (`Wireguard` exposes `init`/`read`/`send`/the timer
//! callbacks and nothing else).

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use crate::host::{Host, HostError};
use crate::identity::Eid;
use crate::stream::{ListenMode, StreamId};

/// Which half (or both) of a stream to tear down (spec.md §6.4's `stream::shutdown`;
/// `include/base_stream.h`'s read/write/close/reset distinction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
	Read,
	Write,
	Close,
	/// Abortive teardown: neither side should expect buffered data to arrive.
	Reset,
}

/// Listens for incoming top-level streams offering a given (service, protocol)
/// pair (spec.md §6.4 `server::listen`/`server::accept`; `include/sss/server.h`).
pub struct Server {
	host: Rc<RefCell<Host>>,
	service: String,
	protocol: String,
}

impl Server {
	/// Registers `(service, protocol)` on `host` and returns the handle to accept
	/// through. Fails if this host already has a listener for that pair.
	pub fn listen(host: Rc<RefCell<Host>>, service: &str, service_desc: &str, protocol: &str, protocol_desc: &str) -> Result<Self, HostError> {
		host.borrow_mut().listen(service, service_desc, protocol, protocol_desc)?;

		Ok(Self { host, service: service.to_string(), protocol: protocol.to_string() })
	}

	/// Dequeues the next incoming connection for this service, if one has
	/// finished its negotiation handshake (spec.md §6.4 `server::accept`).
	pub fn accept(&self) -> Option<Stream> {
		let (remote, id) = self.host.borrow_mut().accept(&self.service, &self.protocol)?;
		Some(Stream { host: self.host.clone(), remote, id })
	}

	pub fn service(&self) -> &str {
		&self.service
	}

	pub fn protocol(&self) -> &str {
		&self.protocol
	}
}

impl Drop for Server {
	fn drop(&mut self) {
		self.host.borrow_mut().stop_listening(&self.service, &self.protocol);
	}
}

/// One logical stream, named by the remote identity that owns it and the local
/// id [`crate::peer::Peer`] allocated for it. Cheap to clone in spirit (it's just
/// two identifiers plus a shared handle) but intentionally doesn't implement
/// `Clone` itself, since a stream's read/write cursors are exclusively owned by
/// whichever part of the application is driving it.
pub struct Stream {
	host: Rc<RefCell<Host>>,
	remote: Eid,
	id: StreamId,
}

impl Stream {
	/// Opens a fresh top-level stream to `remote`, requesting `(service,
	/// protocol)`. `location_hint` seeds a candidate endpoint when the host
	/// doesn't already know how to reach `remote` (spec.md §6.4
	/// `stream::connect_to`; `include/stream.h`'s optional `destination_endpoint_hint`).
	pub fn connect_to(
		host: Rc<RefCell<Host>>,
		remote: Eid,
		service: &str,
		protocol: &str,
		location_hint: Option<SocketAddr>,
	) -> Result<Self, HostError> {
		let id = host.borrow_mut().connect(remote, service, protocol, location_hint, Instant::now())?;
		Ok(Self { host, remote, id })
	}

	pub fn remote(&self) -> Eid {
		self.remote
	}

	/// Appends bytes to this stream's send buffer, returning how many were
	/// actually accepted (spec.md §4.4's write-side backpressure).
	pub fn write_data(&self, data: &[u8]) -> usize {
		self.with_stream_mut(0, |stream| stream.write_data(data))
	}

	/// Like [`Self::write_data`], but marks a record boundary once `data` is
	/// fully accepted.
	pub fn write_record(&self, data: &[u8]) -> bool {
		self.with_stream_mut(false, |stream| stream.write_record(data))
	}

	/// Alias for [`Self::write_record`]: the wire carries no distinct datagram
	/// frame type, so a "datagram" here is simply one record (spec.md §6.2's
	/// `Frame` enum has no `Datagram` variant to encode one differently).
	pub fn write_datagram(&self, data: &[u8]) -> bool {
		self.write_record(data)
	}

	pub fn read_data(&self, max: usize) -> Vec<u8> {
		self.with_stream_mut(Vec::new(), |stream| stream.read_data(max))
	}

	pub fn read_record(&self, max: usize) -> Option<Vec<u8>> {
		self.with_stream_mut(None, |stream| stream.read_record(max))
	}

	/// Alias for [`Self::read_record`]; see [`Self::write_datagram`].
	pub fn read_datagram(&self, max: usize) -> Option<Vec<u8>> {
		self.read_record(max)
	}

	pub fn has_pending_read(&self) -> bool {
		self.with_stream_mut(false, |stream| stream.has_pending_read())
	}

	/// Opens a nested substream under this one (spec.md §3's substream tree).
	pub fn open_substream(&self) -> Option<Stream> {
		let mut host = self.host.borrow_mut();
		let peer = host.peer_mut(self.remote)?;
		let id = peer.streams.open_substream(self.id)?;
		peer.mark_ready(id);

		Some(Stream { host: self.host.clone(), remote: self.remote, id })
	}

	/// Dequeues the next substream a remote peer opened under this one, if any
	/// (spec.md §3, §4.4's accepting-a-substream algorithm).
	pub fn accept_substream(&self) -> Option<Stream> {
		let mut host = self.host.borrow_mut();
		let peer = host.peer_mut(self.remote)?;
		let stream = peer.streams.get_mut(self.id)?;
		let id = stream.received_substreams.pop_front()?;

		drop(host);
		Some(Stream { host: self.host.clone(), remote: self.remote, id })
	}

	/// Sets how this stream answers substream `init` attempts naming it as
	/// parent (spec.md §3's `ListenMode`).
	pub fn listen(&self, mode: ListenMode) {
		let mut host = self.host.borrow_mut();
		if let Some(peer) = host.peer_mut(self.remote) {
			if let Some(stream) = peer.streams.get_mut(self.id) {
				stream.listen_mode = mode;
			}
		}
	}

	pub fn set_priority(&self, priority: u8) {
		let mut host = self.host.borrow_mut();
		if let Some(peer) = host.peer_mut(self.remote) {
			if let Some(stream) = peer.streams.get_mut(self.id) {
				stream.priority = priority;
			}
			peer.mark_ready(self.id);
		}
	}

	/// Tears down this stream per `mode` (spec.md §6.4 `stream::shutdown`).
	/// `Reset` sends the peer a RESET frame naming this stream (if it was ever
	/// attached on the live channel) and drops its arena entry immediately; the
	/// other modes queue a FIN and leave the arena entry for any data already
	/// in flight to finish draining.
	pub fn shutdown(&self, mode: ShutdownMode) {
		let mut host = self.host.borrow_mut();
		let Some(peer) = host.peer_mut(self.remote) else { return };

		match mode {
			ShutdownMode::Reset => {
				peer.reset_stream(self.id, Instant::now());
			}
			ShutdownMode::Write | ShutdownMode::Close => {
				if let Some(stream) = peer.streams.get_mut(self.id) {
					stream.queue_fin();
				}
				peer.mark_ready(self.id);
			}
			ShutdownMode::Read => {
				// Nothing to queue on the wire: the local side simply stops
				// reading. Data the remote keeps sending is still delivered into
				// the stream's buffer and silently discarded by never being read.
			}
		}
	}

	fn with_stream_mut<T>(&self, default: T, f: impl FnOnce(&mut crate::stream::Stream) -> T) -> T {
		let mut host = self.host.borrow_mut();
		let Some(peer) = host.peer_mut(self.remote) else { return default };
		let Some(stream) = peer.streams.get_mut(self.id) else { return default };
		f(stream)
	}
}
