//! Shared harness for the UDP context tests: a scripted mock socket, a
//! manually advanced clock, a wire-message builder and expectation queues
//! for every kind of user callback.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::mock::StepRng;

use coap::code::Code;
use coap::config::{Config, UdpTxParams};
use coap::error::{Error, SocketError};
use coap::msg::{self, Kind};
use coap::options::{BlockKind, BlockOption, Options};
use coap::socket::Socket;
use coap::time::TimeProvider;
use coap::token::Token;
use coap::udp::{
	Ctx, DeliveryHandler, ExchangeId, ObserveCancelHandler, PayloadWriter, RequestHandler,
	RequestHeader, RequestState, ResponseHandler, ResponseHeader, ServerRequestState,
};

pub type TestCtx = Ctx<MockSocket, StepRng>;

// ----------------------------------------------------------------------
// Clock

pub struct ManualClock {
	now: Cell<Instant>,
}

impl ManualClock {
	pub fn new() -> ManualClock {
		ManualClock { now: Cell::new(Instant::now()) }
	}

	pub fn advance(&self, by: Duration) {
		self.now.set(self.now.get() + by);
	}

	pub fn set(&self, to: Instant) {
		self.now.set(to);
	}
}

impl TimeProvider for ManualClock {
	fn now(&self) -> Instant {
		self.now.get()
	}
}

// ----------------------------------------------------------------------
// Socket

enum SocketOp {
	Send(Vec<u8>),
	SendError(SocketError),
	Recv(Vec<u8>),
	RecvTimeout,
}

/// Handle to the socket script, shared between the test body and the
/// context-owned socket.
#[derive(Clone)]
pub struct Script {
	ops: Rc<RefCell<VecDeque<SocketOp>>>,
}

impl Script {
	fn new() -> Script {
		Script { ops: Rc::new(RefCell::new(VecDeque::new())) }
	}

	/// The next socket operation must be a send of exactly these bytes.
	pub fn expect_send(&self, msg: &TestMsg) {
		self.ops.borrow_mut().push_back(SocketOp::Send(msg.bytes()));
	}

	pub fn expect_send_bytes(&self, bytes: &[u8]) {
		self.ops.borrow_mut().push_back(SocketOp::Send(bytes.to_vec()));
	}

	/// The next send fails with the given error.
	pub fn expect_send_error(&self, error: SocketError) {
		self.ops.borrow_mut().push_back(SocketOp::SendError(error));
	}

	/// Queue a datagram for the context to receive.
	pub fn input(&self, msg: &TestMsg) {
		self.ops.borrow_mut().push_back(SocketOp::Recv(msg.bytes()));
	}

	pub fn input_bytes(&self, bytes: &[u8]) {
		self.ops.borrow_mut().push_back(SocketOp::Recv(bytes.to_vec()));
	}

	/// The receive loop ends with a timeout.
	pub fn expect_timeout(&self) {
		self.ops.borrow_mut().push_back(SocketOp::RecvTimeout);
	}

	pub fn assert_done(&self) {
		assert!(self.ops.borrow().is_empty(), "socket script not fully consumed");
	}
}

pub struct MockSocket {
	script: Script,
}

impl Socket for MockSocket {
	fn send(&mut self, data: &[u8]) -> Result<(), SocketError> {
		match self.script.ops.borrow_mut().pop_front() {
			Some(SocketOp::Send(expected)) => {
				assert_eq!(
					hex(&expected),
					hex(data),
					"sent datagram does not match the expected bytes"
				);
				Ok(())
			}
			Some(SocketOp::SendError(error)) => Err(error),
			Some(_) => panic!("unexpected send of {} bytes", data.len()),
			None => panic!("send with an exhausted socket script"),
		}
	}

	fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, SocketError> {
		match self.script.ops.borrow_mut().pop_front() {
			Some(SocketOp::Recv(data)) => {
				let copy = data.len().min(buf.len());
				buf[..copy].copy_from_slice(&data[..copy]);
				Ok(Some(data.len()))
			}
			Some(SocketOp::RecvTimeout) => Ok(None),
			Some(SocketOp::Send(expected)) => {
				panic!("expected a send of {} bytes, context tried to receive", expected.len())
			}
			Some(SocketOp::SendError(_)) => panic!("expected a failing send, context tried to receive"),
			None => panic!("receive with an exhausted socket script"),
		}
	}

	fn inner_mtu(&self) -> Option<usize> {
		Some(1500)
	}

	fn set_recv_timeout(&mut self, _: Duration) -> Result<(), SocketError> {
		Ok(())
	}
}

fn hex(data: &[u8]) -> String {
	data.iter().map(|b| format!("{b:02x}")).collect()
}

// ----------------------------------------------------------------------
// Tokens

/// n-th token the deterministic PRNG hands to the context. Creation of
/// the context consumes one `next_u32` draw for the initial message id,
/// so the first token draw yields 1.
pub fn nth_token(n: u64) -> Token {
	Token::new(&(n + 1).to_be_bytes()).unwrap()
}

pub fn make_token(s: &str) -> Token {
	Token::new(s.as_bytes()).unwrap()
}

// ----------------------------------------------------------------------
// Message builder

#[derive(Clone)]
pub struct TestMsg {
	pub kind: Kind,
	pub code: Code,
	pub msg_id: u16,
	pub token: Token,
	pub options: Options,
	pub payload: Vec<u8>,
}

pub fn coap_msg(kind: Kind, code: Code, msg_id: u16) -> TestMsg {
	TestMsg {
		kind,
		code,
		msg_id,
		token: Token::default(),
		options: Options::new(),
		payload: Vec::new(),
	}
}

impl TestMsg {
	pub fn token(mut self, token: Token) -> TestMsg {
		self.token = token;
		self
	}

	pub fn payload(mut self, payload: &[u8]) -> TestMsg {
		self.payload = payload.to_vec();
		self
	}

	pub fn observe(mut self, value: u32) -> TestMsg {
		self.options.set_observe(value);
		self
	}

	pub fn etag(mut self, etag: &[u8]) -> TestMsg {
		self.options.add_etag(etag).unwrap();
		self
	}

	pub fn accept(mut self, format: u16) -> TestMsg {
		self.options.add_uint(coap::options::ACCEPT, format as u32);
		self
	}

	pub fn content_format(mut self, format: u16) -> TestMsg {
		self.options.set_content_format(format);
		self
	}

	pub fn uri_path(mut self, segment: &str) -> TestMsg {
		self.options.add_uri_path(segment);
		self
	}

	pub fn block1(mut self, seq: u32, size: u16, has_more: bool) -> TestMsg {
		self.options
			.set_block(BlockOption::new(BlockKind::Block1, seq, size, has_more).unwrap());
		self
	}

	pub fn block2(mut self, seq: u32, size: u16, has_more: bool) -> TestMsg {
		self.options
			.set_block(BlockOption::new(BlockKind::Block2, seq, size, has_more).unwrap());
		self
	}

	/// Block2 request option, as sent when asking for a specific block.
	pub fn block2_req(self, seq: u32, size: u16) -> TestMsg {
		self.block2(seq, size, false)
	}

	/// One block of a BLOCK1 request carrying the matching chunk of
	/// `full_payload`.
	pub fn block1_req(self, seq: u32, size: u16, full_payload: &[u8]) -> TestMsg {
		let start = seq as usize * size as usize;
		let end = (start + size as usize).min(full_payload.len());

		self.block1(seq, size, end < full_payload.len())
			.payload(&full_payload[start..end])
	}

	/// One block of a BLOCK2 response carrying the matching chunk of
	/// `full_payload`.
	pub fn block2_res(self, seq: u32, size: u16, full_payload: &[u8]) -> TestMsg {
		let start = seq as usize * size as usize;
		let end = (start + size as usize).min(full_payload.len());

		self.block2(seq, size, end < full_payload.len())
			.payload(&full_payload[start..end])
	}

	pub fn bytes(&self) -> Vec<u8> {
		let mut buf = vec![0u8; 70 * 1024];

		let len = msg::serialize(
			self.kind,
			self.code,
			self.msg_id,
			&self.token,
			self.options.bytes(),
			&self.payload,
			&mut buf,
		)
		.expect("test message serialization");

		buf.truncate(len);
		buf
	}

	pub fn request_header(&self) -> RequestHeader {
		RequestHeader { code: self.code, options: self.options.clone() }
	}

	pub fn response_header(&self) -> ResponseHeader {
		ResponseHeader { code: self.code, options: self.options.clone() }
	}
}

pub const DATA_16B: &[u8] = b"0123456789abcdef";

pub fn data_kb(kb: usize) -> Vec<u8> {
	DATA_16B.iter().copied().cycle().take(kb * 1024).collect()
}

/// 1 KiB of payload plus a one-byte tail, the classic two-block case.
pub fn data_1kb_plus(extra: &[u8]) -> Vec<u8> {
	let mut data = data_kb(1);
	data.extend_from_slice(extra);
	data
}

// ----------------------------------------------------------------------
// Handler expectations

pub struct ExpectedResponse {
	pub code: Code,
	pub options: Vec<u8>,
	pub payload: Vec<u8>,
	pub payload_offset: usize,
}

pub struct ExpectedRequest {
	pub code: Code,
	pub options: Vec<u8>,
	pub payload: Vec<u8>,
	pub payload_offset: usize,
	pub observe_token: Option<Token>,
}

pub enum Expect {
	Response {
		id: ExchangeId,
		state: RequestState,
		response: Option<ExpectedResponse>,
		/// Offset to request via `set_next_response_payload_offset` from
		/// inside the handler.
		skip_to: Option<usize>,
		/// Cancel the exchange from inside the handler.
		abort: bool,
	},
	Request {
		state: ServerRequestState,
		request: Option<ExpectedRequest>,
		/// Set up this response from inside the handler.
		respond: Option<(ResponseHeader, Option<Rc<WriterCfg>>)>,
		start_observe: bool,
		/// Fail the handler after doing everything else.
		fail: bool,
		/// Issue a fire-and-forget NON GET from inside the handler.
		send_request: bool,
	},
	ObserveStart(Token),
	ObserveCancel(Token),
	Delivery(Result<(), Error>),
}

#[derive(Clone)]
pub struct Expects {
	list: Rc<RefCell<VecDeque<Expect>>>,
}

impl Expects {
	fn new() -> Expects {
		Expects { list: Rc::new(RefCell::new(VecDeque::new())) }
	}

	pub fn push(&self, expect: Expect) {
		self.list.borrow_mut().push_back(expect);
	}

	fn pop(&self) -> Expect {
		self.list.borrow_mut().pop_front().expect("unexpected handler invocation")
	}

	pub fn assert_done(&self) {
		assert!(self.list.borrow().is_empty(), "not all expected handler calls happened");
	}

	pub fn expect_handler_call(&self, id: ExchangeId, state: RequestState, msg: Option<&TestMsg>) {
		self.push(Expect::Response {
			id,
			state,
			response: msg.map(|m| ExpectedResponse {
				code: m.code,
				options: m.options.bytes().to_vec(),
				payload: m.payload.clone(),
				payload_offset: 0,
			}),
			skip_to: None,
			abort: false,
		});
	}

	/// Like `expect_handler_call` but for one block of a larger payload:
	/// the delivered slice starts `chop` bytes into the block.
	pub fn expect_partial_call(
		&self,
		id: ExchangeId,
		state: RequestState,
		msg: &TestMsg,
		chop: usize,
		payload_offset: usize,
		skip_to: Option<usize>,
	) {
		self.push(Expect::Response {
			id,
			state,
			response: Some(ExpectedResponse {
				code: msg.code,
				options: msg.options.bytes().to_vec(),
				payload: msg.payload[chop..].to_vec(),
				payload_offset,
			}),
			skip_to,
			abort: false,
		});
	}

	pub fn expect_request_call(
		&self,
		state: ServerRequestState,
		request: Option<&TestMsg>,
		respond: Option<(ResponseHeader, Option<Rc<WriterCfg>>)>,
	) {
		let request = request.map(|m| {
			let payload_offset = m
				.options
				.block(BlockKind::Block1)
				.unwrap()
				.map(|b| b.offset())
				.unwrap_or(0);

			ExpectedRequest {
				code: m.code,
				options: m.options.bytes().to_vec(),
				payload: m.payload.clone(),
				payload_offset,
				observe_token: (m.options.observe() == Some(0)).then_some(m.token),
			}
		});

		let start_observe = request
			.as_ref()
			.map(|r| r.observe_token.is_some() && respond.is_some())
			.unwrap_or(false);

		self.push(Expect::Request {
			state,
			request,
			respond,
			start_observe,
			fail: false,
			send_request: false,
		});
	}

	pub fn expect_cleanup_call(&self) {
		self.push(Expect::Request {
			state: ServerRequestState::Cleanup,
			request: None,
			respond: None,
			start_observe: false,
			fail: false,
			send_request: false,
		});
	}

	pub fn expect_observe_start(&self, token: Token) {
		self.push(Expect::ObserveStart(token));
	}

	pub fn expect_observe_cancel(&self, token: Token) {
		self.push(Expect::ObserveCancel(token));
	}

	pub fn expect_delivery(&self, result: Result<(), Error>) {
		self.push(Expect::Delivery(result));
	}
}

pub fn response_handler(expects: &Expects) -> ResponseHandler<MockSocket, StepRng> {
	let expects = expects.clone();

	Box::new(move |ctx, id, state, response| {
		let Expect::Response { id: want_id, state: want_state, response: want, skip_to, abort } =
			expects.pop()
		else {
			panic!("response handler called while expecting something else");
		};

		assert_eq!(want_id, id);
		assert_eq!(want_state, state);

		match (&want, response) {
			(Some(want), Some(got)) => {
				assert_eq!(want.code, got.code);
				assert_eq!(&want.options[..], got.options.bytes());
				assert_eq!(&want.payload[..], got.payload);
				assert_eq!(want.payload_offset, got.payload_offset);
			}
			(None, None) => {}
			_ => panic!("response presence mismatch in state {state:?}"),
		}

		if let Some(offset) = skip_to {
			ctx.set_next_response_payload_offset(id, offset).unwrap();
		}

		if abort {
			ctx.exchange_cancel(id);
		}
	})
}

pub fn request_handler(expects: &Expects) -> RequestHandler<MockSocket, StepRng> {
	let expects = expects.clone();

	Box::new(move |ctx, id, state, request| {
		let Expect::Request { state: want_state, request: want, respond, start_observe, fail, send_request } =
			expects.pop()
		else {
			panic!("request handler called while expecting something else");
		};

		assert_eq!(want_state, state);

		if state == ServerRequestState::Cleanup {
			assert!(request.is_none());
			return Ok(());
		}

		let request = request.expect("request data missing");

		if let Some(want) = &want {
			assert_eq!(want.code, request.code);
			assert_eq!(&want.options[..], request.options.bytes());
			assert_eq!(&want.payload[..], request.payload);
			assert_eq!(want.payload_offset, request.payload_offset);
			assert_eq!(want.observe_token, request.observe.map(|o| o.token));
		}

		if start_observe {
			let observe = request.observe.expect("observation requested without Observe=0");

			match expects.pop() {
				Expect::ObserveStart(token) => assert_eq!(token, observe.token),
				_ => panic!("observation started unexpectedly"),
			}

			ctx.observe_async_start(observe, observe_cancel_handler(&expects)).unwrap();
		}

		if let Some((header, writer)) = respond {
			ctx.setup_async_response(id, header, writer.map(payload_writer)).unwrap();
		}

		if send_request {
			let header = RequestHeader { code: Code::GET, options: Options::new() };
			ctx.send_async_request(Kind::NonConfirmable, header, None, None).unwrap();
		}

		if fail {
			return Err(());
		}

		Ok(())
	})
}

pub fn observe_cancel_handler(expects: &Expects) -> ObserveCancelHandler<MockSocket, StepRng> {
	let expects = expects.clone();

	Box::new(move |_ctx, id| match expects.pop() {
		Expect::ObserveCancel(token) => assert_eq!(token, id.token),
		_ => panic!("observation cancelled unexpectedly"),
	})
}

pub fn delivery_handler(expects: &Expects) -> DeliveryHandler<MockSocket, StepRng> {
	let expects = expects.clone();

	Box::new(move |_ctx, result| match expects.pop() {
		Expect::Delivery(want) => assert_eq!(want, result),
		_ => panic!("delivery handler called unexpectedly"),
	})
}

// ----------------------------------------------------------------------
// Payload writer

pub struct WriterCfg {
	pub data: Vec<u8>,
	pub expected_offset: Cell<usize>,
	/// Cancel this exchange from inside the writer.
	pub cancel: Cell<Option<ExchangeId>>,
	/// Cancel whatever exchange the writer is serving; resolved to a
	/// concrete id by the request handler installing the writer.
	pub cancel_current: Cell<bool>,
	/// Report failure after this many successful calls (0 = never).
	pub calls_until_fail: Cell<usize>,
}

impl WriterCfg {
	pub fn new(data: &[u8]) -> Rc<WriterCfg> {
		Rc::new(WriterCfg {
			data: data.to_vec(),
			expected_offset: Cell::new(0),
			cancel: Cell::new(None),
			cancel_current: Cell::new(false),
			calls_until_fail: Cell::new(0),
		})
	}

	pub fn failing(data: &[u8], calls: usize) -> Rc<WriterCfg> {
		let cfg = WriterCfg::new(data);
		cfg.calls_until_fail.set(calls);
		cfg
	}
}

pub fn payload_writer(cfg: Rc<WriterCfg>) -> PayloadWriter<MockSocket, StepRng> {
	Box::new(move |ctx, id, offset, buf| {
		assert_eq!(cfg.expected_offset.get(), offset, "writer asked out of order");
		assert!(offset <= cfg.data.len());

		let len = (cfg.data.len() - offset).min(buf.len());
		buf[..len].copy_from_slice(&cfg.data[offset..offset + len]);
		cfg.expected_offset.set(offset + len);

		if let Some(other) = cfg.cancel.get() {
			ctx.exchange_cancel(other);
		}

		if cfg.cancel_current.get() {
			ctx.exchange_cancel(id);
		}

		let fail_in = cfg.calls_until_fail.get();
		if fail_in == 1 {
			cfg.calls_until_fail.set(0);
			return Err(());
		} else if fail_in > 1 {
			cfg.calls_until_fail.set(fail_in - 1);
		}

		Ok(len)
	})
}

// ----------------------------------------------------------------------
// Environment

pub struct TestEnv {
	pub ctx: TestCtx,
	pub script: Script,
	pub expects: Expects,
	pub clock: Arc<ManualClock>,
}

pub fn setup(params: UdpTxParams, in_size: usize, out_size: usize, cache: usize) -> TestEnv {
	let script = Script::new();
	let clock = Arc::new(ManualClock::new());

	let config = Config {
		tx_params: params,
		input_buffer_size: in_size,
		output_buffer_size: out_size,
		response_cache_size: cache,
		..Config::default()
	};

	let ctx = Ctx::new(
		MockSocket { script: script.clone() },
		StepRng::new(0, 1),
		clock.clone(),
		config,
	)
	.unwrap();

	TestEnv {
		ctx,
		script,
		expects: Expects::new(),
		clock,
	}
}

/// Deterministic timings and an NSTART high enough to never hold
/// anything, like most of the suite wants.
pub fn setup_default() -> TestEnv {
	setup(deterministic_params(999), 4096, 4096, 0)
}

pub fn deterministic_params(nstart: usize) -> UdpTxParams {
	UdpTxParams {
		ack_random_factor: 1.0,
		nstart,
		..UdpTxParams::default()
	}
}

pub fn setup_with_nstart(nstart: usize) -> TestEnv {
	setup(deterministic_params(nstart), 4096, 4096, 0)
}

pub fn setup_with_max_retransmit(max_retransmit: u32) -> TestEnv {
	let params = UdpTxParams { max_retransmit, ..deterministic_params(999) };
	setup(params, 4096, 4096, 0)
}

pub fn setup_with_cache(cache: usize) -> TestEnv {
	setup(deterministic_params(999), 4096, 4096, cache)
}

impl TestEnv {
	pub fn handle_incoming(&mut self) -> Result<(), Error> {
		self.ctx.handle_incoming_packet(None)
	}

	/// Like `handle_incoming`, but new requests are accepted and routed to
	/// a handler fed from the expectation queue.
	pub fn handle_incoming_with_accept(&mut self) -> Result<(), Error> {
		let expects = self.expects.clone();

		let mut accept = move |ctx: &mut TestCtx, _request: &coap::IncomingRequest<'_>| {
			ctx.accept_async_request(request_handler(&expects))
				.map(|_| ())
				.map_err(|_| Code::INTERNAL_SERVER_ERROR)
		};

		self.ctx.handle_incoming_packet(Some(&mut accept))
	}

	/// Jumps the clock to the engine's next deadline and fires it.
	pub fn run_next_timeout(&mut self) {
		let deadline = self.ctx.next_timeout().expect("no timer armed");
		self.clock.set(deadline);
		self.ctx.handle_timeout();
	}

	pub fn advance(&self, by: Duration) {
		self.clock.advance(by);
	}
}

/// Destroys the context (cancelling whatever is left) and verifies that
/// both the socket script and the handler expectations ran dry.
pub fn teardown(env: TestEnv) {
	let TestEnv { ctx, script, expects, clock } = env;
	drop(ctx);
	drop(clock);

	script.assert_done();
	expects.assert_done();
}
