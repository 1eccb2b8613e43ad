// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pipeline-level integration tests (§8 items 6, 7, 10, 11, 12, 13, 14, 15,
//! 16 — Scenarios A-F) run against an in-process scripted [`Transport`]
//! rather than a real socket.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use nosqldb_core::client::{Client, NoSQLConfig};
use nosqldb_core::error::{ErrorCode, NoSQLError, Result};
use nosqldb_core::events::Observer;
use nosqldb_core::field_value::{FieldValue, MapValue};
use nosqldb_core::nson::{keys, NsonWriter};
use nosqldb_core::op::{OpResult, PrepareOp, QueryOp, TableRequestOp, WriteSubOp};
use nosqldb_core::prepared_statement::PreparedStatement;
use nosqldb_core::protocol::binary::BinaryWriter;
use nosqldb_core::protocol::ProtocolVersion;
use nosqldb_core::request::{Request, RequestOptions};
use nosqldb_core::transport::{RawResponse, Transport};
use nosqldb_core::types::{Consistency, ContinuationKey, TableState};
use nosqldb_codec::ResizableBuffer;

/// Builds the V2/V3 binary-protocol body `GetOp::deserialize` expects: a
/// zero error-code byte, `{readUnits, readKB, writeKB}`, then the
/// row-present flag, row, expiration, and version.
fn binary_get_success(version: ProtocolVersion, row: &MapValue, version_bytes: &[u8]) -> Vec<u8> {
	let mut buf = ResizableBuffer::new();
	let mut w = BinaryWriter::new(&mut buf, version);
	let off = w.buf.len();
	w.buf.write_u8(0, off);
	w.write_int(100);
	w.write_int(1);
	w.write_int(1);
	w.write_boolean(true);
	w.write_field_value(&FieldValue::Map(row.clone()));
	w.write_long(0);
	w.write_binary(Some(version_bytes));
	buf.slice(0, buf.len()).unwrap().to_vec()
}

struct ScriptedResponse {
	status: u16,
	body: Vec<u8>,
	set_cookie: Option<String>,
}

/// Hands back one canned response per call, in order, and records every
/// request's headers so a test can assert on cookie/auth propagation.
struct ScriptedTransport {
	responses: Mutex<VecDeque<ScriptedResponse>>,
	seen_headers: Mutex<Vec<Vec<(String, String)>>>,
	seen_bodies: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTransport {
	fn new(responses: Vec<ScriptedResponse>) -> Self {
		Self {
			responses: Mutex::new(responses.into_iter().collect()),
			seen_headers: Mutex::new(Vec::new()),
			seen_bodies: Mutex::new(Vec::new()),
		}
	}
}

#[async_trait]
impl Transport for ScriptedTransport {
	async fn send(&self, body: Vec<u8>, headers: Vec<(String, String)>, _timeout: Duration) -> Result<RawResponse> {
		self.seen_headers.lock().push(headers);
		self.seen_bodies.lock().push(body);
		let next = self
			.responses
			.lock()
			.pop_front()
			.expect("test script ran out of canned responses");
		Ok(RawResponse {
			status: next.status,
			body: next.body,
			set_cookie: next.set_cookie,
		})
	}
}

fn opts() -> RequestOptions {
	RequestOptions {
		timeout: Duration::from_secs(2),
		consistency: Consistency::Eventual,
		durability: None,
		compartment: None,
		namespace: None,
	}
}

fn config_with_transport() -> NoSQLConfig {
	NoSQLConfig::new("https://localhost:443")
}

fn nson_get_success(row: &MapValue, version_bytes: &[u8]) -> Vec<u8> {
	let mut buf = ResizableBuffer::new();
	let mut w = NsonWriter::new(&mut buf);
	w.start_map();
	w.write_int_field(keys::ERROR_CODE, 0);
	w.start_payload();
	w.write_map_field(keys::ROW, row);
	w.write_binary_field(keys::ROW_VERSION, version_bytes);
	w.end_payload();
	w.end_map();
	buf.slice(0, buf.len()).unwrap().to_vec()
}

fn nson_put_success(version_bytes: &[u8]) -> Vec<u8> {
	let mut buf = ResizableBuffer::new();
	let mut w = NsonWriter::new(&mut buf);
	w.start_map();
	w.write_int_field(keys::ERROR_CODE, 0);
	w.start_payload();
	w.write_true_bool_field(keys::SUCCESS, true);
	w.write_binary_field(keys::ROW_VERSION, version_bytes);
	w.end_payload();
	w.end_map();
	buf.slice(0, buf.len()).unwrap().to_vec()
}

fn nson_server_error(code: i32) -> Vec<u8> {
	let mut buf = ResizableBuffer::new();
	let mut w = NsonWriter::new(&mut buf);
	w.start_map();
	w.write_int_field(keys::ERROR_CODE, code);
	w.end_map();
	buf.slice(0, buf.len()).unwrap().to_vec()
}

fn get_request(table: &str, id: i32) -> Request {
	let mut key = MapValue::new();
	key.insert("id", FieldValue::Integer(id));
	let mut req = Request::new(Arc::new(nosqldb_core::op::GetOp), opts(), ProtocolVersion::V4, 1);
	req.set_table_name(table);
	req.key = Some(key);
	req
}

fn put_request(table: &str, id: i32) -> Request {
	let mut row = MapValue::new();
	row.insert("id", FieldValue::Integer(id));
	row.insert("name", FieldValue::String("widget".into()));
	let mut req = Request::new(Arc::new(nosqldb_core::op::PutOp), opts(), ProtocolVersion::V4, 1);
	req.set_table_name(table);
	req.value = Some(row);
	req
}

/// §8 item 11 — Scenario A: Put then Get round-trips the same row/version.
#[tokio::test]
async fn scenario_a_get_put_roundtrip() {
	let put_resp = nson_put_success(&[1, 2, 3]);
	let mut row = MapValue::new();
	row.insert("id", FieldValue::Integer(1));
	row.insert("name", FieldValue::String("widget".into()));
	let get_resp = nson_get_success(&row, &[1, 2, 3]);

	let transport = Arc::new(ScriptedTransport::new(vec![
		ScriptedResponse { status: 200, body: put_resp, set_cookie: None },
		ScriptedResponse { status: 200, body: get_resp, set_cookie: None },
	]));
	let client = Client::with_transport(config_with_transport(), transport).await.unwrap();

	let put_result = client.execute(put_request("orders", 1)).await.unwrap();
	assert!(matches!(put_result, OpResult::Put { success: true, .. }));

	let get_result = client.execute(get_request("orders", 1)).await.unwrap();
	match get_result {
		OpResult::Get { row: got, version, .. } => {
			assert_eq!(got, Some(row));
			assert_eq!(version, Some(vec![1, 2, 3]));
		}
		other => panic!("unexpected result: {other:?}"),
	}
}

/// §8 item 10 — a `Set-Cookie: session=...` on the first response is carried
/// as `Cookie` on the next request.
#[tokio::test]
async fn cookie_persists_across_requests() {
	let mut row = MapValue::new();
	row.insert("id", FieldValue::Integer(1));
	let resp1 = nson_get_success(&row, &[9]);
	let resp2 = nson_get_success(&row, &[9]);

	let transport = Arc::new(ScriptedTransport::new(vec![
		ScriptedResponse {
			status: 200,
			body: resp1,
			set_cookie: Some("session=abc123; Path=/; HttpOnly".to_string()),
		},
		ScriptedResponse { status: 200, body: resp2, set_cookie: None },
	]));
	let client = Client::with_transport(config_with_transport(), Arc::clone(&transport) as Arc<dyn Transport>)
		.await
		.unwrap();

	client.execute(get_request("orders", 1)).await.unwrap();
	client.execute(get_request("orders", 1)).await.unwrap();

	let seen = transport.seen_headers.lock();
	assert_eq!(seen.len(), 2);
	assert!(!seen[0].iter().any(|(k, _)| k == "Cookie"));
	assert!(seen[1].iter().any(|(k, v)| k == "Cookie" && v == "session=abc123"));
}

/// §8 item 16 — Scenario F: two `READ_LIMIT_EXCEEDED` responses followed by
/// success; the observer sees exactly two retryable events.
#[tokio::test]
async fn scenario_f_throttled_retry_succeeds_on_third_attempt() {
	let mut row = MapValue::new();
	row.insert("id", FieldValue::Integer(7));
	let ok = nson_get_success(&row, &[5]);

	let transport = Arc::new(ScriptedTransport::new(vec![
		ScriptedResponse {
			status: 200,
			body: nson_server_error(ErrorCode::ReadLimitExceeded as i32),
			set_cookie: None,
		},
		ScriptedResponse {
			status: 200,
			body: nson_server_error(ErrorCode::ReadLimitExceeded as i32),
			set_cookie: None,
		},
		ScriptedResponse { status: 200, body: ok, set_cookie: None },
	]));

	#[derive(Default)]
	struct CountingObserver {
		retryable: AtomicU32,
	}
	impl Observer for CountingObserver {
		fn on_retryable(&self, _req: &Request, _err: &NoSQLError, _attempt: u32) {
			self.retryable.fetch_add(1, Ordering::SeqCst);
		}
	}

	let observer = Arc::new(CountingObserver::default());
	let mut config = config_with_transport();
	config.observer = Some(Arc::clone(&observer) as Arc<dyn Observer>);
	config.timeout = Duration::from_secs(5);
	let client = Client::with_transport(config, transport).await.unwrap();

	let result = client.execute(get_request("orders", 7)).await.unwrap();
	assert!(matches!(result, OpResult::Get { row: Some(_), .. }));
	assert_eq!(observer.retryable.load(Ordering::SeqCst), 2);
}

/// §8 item 6 — protocol downgrade: a server reporting `UNSUPPORTED_PROTOCOL`
/// at V4 and V3 forces the client down to V2, where the real request
/// finally succeeds; the live protocol version stays at V2 afterward.
#[tokio::test]
async fn protocol_downgrades_to_v2_on_unsupported_protocol() {
	let mut row = MapValue::new();
	row.insert("id", FieldValue::Integer(3));
	let ok = binary_get_success(ProtocolVersion::V2, &row, &[4]);

	let transport = Arc::new(ScriptedTransport::new(vec![
		ScriptedResponse { status: 400, body: vec![ErrorCode::UnsupportedProtocol as u8], set_cookie: None },
		ScriptedResponse { status: 400, body: vec![ErrorCode::UnsupportedProtocol as u8], set_cookie: None },
		ScriptedResponse { status: 200, body: ok, set_cookie: None },
	]));
	let client = Client::with_transport(config_with_transport(), Arc::clone(&transport) as Arc<dyn Transport>)
		.await
		.unwrap();

	// The first two attempts are serialized and sent at V4 and V3
	// respectively (each rejected with UNSUPPORTED_PROTOCOL); the third
	// lands on V2, where the binary codec's row-response parsing applies.
	let result = client.execute(get_request("orders", 3)).await.unwrap();
	assert!(matches!(result, OpResult::Get { row: Some(_), .. }));
	assert_eq!(transport.seen_headers.lock().len(), 3);
}

/// §8 item 7 — retry budget: a server that permanently returns a retryable
/// service error causes the client to time out rather than retry forever,
/// and the elapsed wall time stays within the configured timeout plus one
/// backoff step.
#[tokio::test]
async fn retry_budget_times_out_on_permanent_failure() {
	let mut responses = Vec::new();
	for _ in 0..50 {
		responses.push(ScriptedResponse { status: 503, body: b"overloaded".to_vec(), set_cookie: None });
	}
	let transport = Arc::new(ScriptedTransport::new(responses));

	let mut config = config_with_transport();
	config.timeout = Duration::from_millis(150);
	let client = Client::with_transport(config, transport).await.unwrap();

	let mut req = get_request("orders", 1);
	req.options.timeout = Duration::from_millis(150);
	let start = std::time::Instant::now();
	let err = client.execute(req).await.unwrap_err();
	let elapsed = start.elapsed();

	assert!(matches!(err, NoSQLError::Timeout { .. }));
	assert!(elapsed < Duration::from_secs(2), "runaway retry loop: {elapsed:?}");
}

/// Builds a prepared-statement blob with the fixed prefix `PreparedStatement`
/// expects: `{4-byte length, 32-byte hash, 1-byte table count, (namespace,
/// table) pairs, opcode}`, the rest of the blob left as opaque filler.
fn sample_prepared_blob(table_name: &str) -> Vec<u8> {
	let mut buf = ResizableBuffer::new();
	let off = buf.len();
	buf.write_i32_be(0, off);
	let off = buf.len();
	buf.write_bytes_at(&[0x42u8; 32], off);
	let off = buf.len();
	buf.write_u8(1, off);
	let off = buf.len();
	nosqldb_codec::write_sorted_int32(&mut buf, off, -1);
	let off = buf.len();
	let end = nosqldb_codec::write_sorted_int32(&mut buf, off, table_name.len() as i32);
	buf.write_bytes_at(table_name.as_bytes(), end);
	let off = buf.len();
	buf.write_u8(nosqldb_core::types::OpCode::Query as u8, off);
	// Trailing filler bytes stand in for the server-executed query plan the
	// driver never interprets, so a byte-identical round trip actually
	// exercises something beyond the fixed prefix.
	let off = buf.len();
	buf.write_bytes_at(&[0xAA, 0xBB, 0xCC], off);
	buf.slice(0, buf.len()).unwrap().to_vec()
}

fn nson_prepare_success(blob: &[u8]) -> Vec<u8> {
	let mut buf = ResizableBuffer::new();
	let mut w = NsonWriter::new(&mut buf);
	w.start_map();
	w.write_int_field(keys::ERROR_CODE, 0);
	w.start_payload();
	w.write_binary_field(keys::PREPARED_STATEMENT, blob);
	w.end_payload();
	w.end_map();
	buf.slice(0, buf.len()).unwrap().to_vec()
}

fn nson_query_success(rows: &[MapValue], continuation_key: Option<&[u8]>) -> Vec<u8> {
	let mut buf = ResizableBuffer::new();
	let mut w = NsonWriter::new(&mut buf);
	w.start_map();
	w.write_int_field(keys::ERROR_CODE, 0);
	w.start_payload();
	w.write_field_name(keys::QUERY_RESULTS);
	w.start_array();
	for row in rows {
		w.write_map_value(row);
	}
	w.end_array();
	if let Some(ck) = continuation_key {
		w.write_binary_field(keys::CONTINUATION_KEY, ck);
	}
	w.end_payload();
	w.end_map();
	buf.slice(0, buf.len()).unwrap().to_vec()
}

fn nson_write_multiple_abort(fail_index: i32, existing_row: &MapValue) -> Vec<u8> {
	let mut buf = ResizableBuffer::new();
	let mut w = NsonWriter::new(&mut buf);
	w.start_map();
	w.write_int_field(keys::ERROR_CODE, 0);
	w.start_payload();
	w.write_bool_field(keys::WM_SUCCESS, false);
	w.write_int_field(keys::WM_FAIL_INDEX, fail_index);
	w.write_field_name(keys::OPERATIONS);
	w.start_array();
	w.start_map();
	w.write_bool_field(keys::SUCCESS, false);
	w.write_map_field(keys::EXISTING_VALUE, existing_row);
	w.end_map();
	w.end_array();
	w.end_payload();
	w.end_map();
	buf.slice(0, buf.len()).unwrap().to_vec()
}

fn nson_table_result(table_name: &str, state: TableState) -> Vec<u8> {
	let mut buf = ResizableBuffer::new();
	let mut w = NsonWriter::new(&mut buf);
	w.start_map();
	w.write_int_field(keys::ERROR_CODE, 0);
	w.start_payload();
	w.write_string_field(keys::TABLE_NAME, table_name);
	w.write_int_field(keys::TABLE_STATE, state as i32);
	w.end_payload();
	w.end_map();
	buf.slice(0, buf.len()).unwrap().to_vec()
}

fn query_request(statement: &str) -> Request {
	let mut req = Request::new(Arc::new(QueryOp), opts(), ProtocolVersion::V4, 1);
	req.statement = Some(statement.to_string());
	req
}

fn prepared_query_request(ps: &Arc<PreparedStatement>, id: i32) -> Request {
	let mut req = Request::new(Arc::new(QueryOp), opts(), ProtocolVersion::V4, 1);
	req.prepared_statement = Some(Arc::clone(ps));
	req.bind_variables.insert("$id".to_string(), FieldValue::Integer(id));
	req
}

/// §8 item 12 — Scenario B: a query prepared once is executed with two
/// different bind values, each returning its own row, and the prepared blob
/// bytes sent on the wire are byte-identical across both executions.
#[tokio::test]
async fn scenario_b_prepared_query_rebind() {
	let blob = sample_prepared_blob("t");
	let prepare_resp = nson_prepare_success(&blob);

	let mut row1 = MapValue::new();
	row1.insert("id", FieldValue::Integer(1));
	let mut row2 = MapValue::new();
	row2.insert("id", FieldValue::Integer(2));

	let transport = Arc::new(ScriptedTransport::new(vec![
		ScriptedResponse { status: 200, body: prepare_resp, set_cookie: None },
		ScriptedResponse {
			status: 200,
			body: nson_query_success(&[row1.clone()], None),
			set_cookie: None,
		},
		ScriptedResponse {
			status: 200,
			body: nson_query_success(&[row2.clone()], None),
			set_cookie: None,
		},
	]));
	let client = Client::with_transport(config_with_transport(), Arc::clone(&transport) as Arc<dyn Transport>)
		.await
		.unwrap();

	let mut prepare_req = Request::new(Arc::new(PrepareOp), opts(), ProtocolVersion::V4, 1);
	prepare_req.statement = Some("SELECT * FROM t WHERE id = $id".to_string());
	let prepared = match client.execute(prepare_req).await.unwrap() {
		OpResult::Prepare { statement } => statement,
		other => panic!("unexpected result: {other:?}"),
	};
	assert_eq!(prepared.statement_blob(), blob.as_slice());

	let first = client.execute(prepared_query_request(&prepared, 1)).await.unwrap();
	match first {
		OpResult::Query { rows, .. } => assert_eq!(rows, vec![row1]),
		other => panic!("unexpected result: {other:?}"),
	}

	let second = client.execute(prepared_query_request(&prepared, 2)).await.unwrap();
	match second {
		OpResult::Query { rows, .. } => assert_eq!(rows, vec![row2]),
		other => panic!("unexpected result: {other:?}"),
	}

	let seen = transport.seen_bodies.lock();
	assert_eq!(seen.len(), 3);
	// The two query attempts (indices 1 and 2) both carry the exact blob
	// bytes the Prepare response returned — the driver never re-derives or
	// mutates it.
	let blob_in = |body: &[u8]| -> Vec<u8> {
		let mut rb = ResizableBuffer::with_capacity(body.len());
		rb.append_bytes(body);
		let mut reader = nosqldb_core::nson::NsonReader::new(&rb);
		let mut top = nosqldb_core::nson::MapCursor::enter(&mut reader).unwrap();
		let mut found = Vec::new();
		while top.has_next() {
			top.next().unwrap();
			match top.current_name() {
				keys::HEADER => top.skip_value().unwrap(),
				keys::PAYLOAD => {
					let mut p = nosqldb_core::nson::MapCursor::enter(top.reader_mut()).unwrap();
					while p.has_next() {
						p.next().unwrap();
						if p.current_name() == keys::PREPARED_QUERY {
							if let FieldValue::Binary(b) = p.read_value().unwrap() {
								found = b;
							}
						} else {
							p.skip_value().unwrap();
						}
					}
					p.finish().unwrap();
				}
				_ => top.skip_value().unwrap(),
			}
		}
		top.finish().unwrap();
		found
	};
	assert_eq!(blob_in(&seen[1]), blob);
	assert_eq!(blob_in(&seen[2]), blob);
}

/// §8 item 13 — Scenario C: a paginated query over 350 rows with `limit=100`
/// yields 4 responses, each but the last carrying a continuation key; the
/// union of rows returned equals the table contents with no duplicates.
#[tokio::test]
async fn scenario_c_paginated_query_covers_all_rows_once() {
	let total_rows = 350usize;
	let page_size = 100usize;
	let all_rows: Vec<MapValue> = (0..total_rows)
		.map(|i| {
			let mut row = MapValue::new();
			row.insert("id", FieldValue::Integer(i as i32));
			row
		})
		.collect();

	let mut responses = Vec::new();
	for (page_idx, chunk) in all_rows.chunks(page_size).enumerate() {
		let is_last = (page_idx + 1) * page_size >= total_rows;
		let ck = if is_last { None } else { Some(vec![page_idx as u8 + 1]) };
		responses.push(ScriptedResponse {
			status: 200,
			body: nson_query_success(chunk, ck.as_deref()),
			set_cookie: None,
		});
	}
	assert_eq!(responses.len(), 4, "350 rows at 100/page should take exactly 4 round trips");

	let transport = Arc::new(ScriptedTransport::new(responses));
	let client = Client::with_transport(config_with_transport(), transport).await.unwrap();

	let mut collected = Vec::new();
	let mut continuation: Option<Vec<u8>> = None;
	let mut page_count = 0;
	loop {
		let mut req = query_request("SELECT * FROM t");
		req.max_read_kb = page_size as i32;
		req.set_continuation_key(continuation.clone());
		let result = client.execute(req).await.unwrap();
		page_count += 1;
		match result {
			OpResult::Query { rows, continuation_key, .. } => {
				collected.extend(rows);
				continuation = match continuation_key {
					ContinuationKey::Bytes(b) => Some(b),
					_ => None,
				};
				if continuation.is_none() {
					break;
				}
			}
			other => panic!("unexpected result: {other:?}"),
		}
		assert!(page_count <= 10, "pagination did not terminate");
	}

	assert_eq!(page_count, 4);
	assert_eq!(collected.len(), total_rows);
	let mut seen_ids: Vec<i32> = collected
		.iter()
		.map(|r| match r.get("id") {
			Some(FieldValue::Integer(i)) => *i,
			_ => panic!("row missing id"),
		})
		.collect();
	seen_ids.sort_unstable();
	seen_ids.dedup();
	assert_eq!(seen_ids.len(), total_rows, "pagination produced a duplicate or missing row");
}

/// §8 item 14 — Scenario D: a 3-put batch where the 2nd entry's `ifAbsent`
/// fails against an existing row and `abortOnFail` is set aborts the whole
/// batch; the reported failure carries the existing row and no write lands.
#[tokio::test]
async fn scenario_d_write_multiple_aborts_on_conflict() {
	let mut existing = MapValue::new();
	existing.insert("id", FieldValue::Integer(2));
	existing.insert("name", FieldValue::String("already-here".into()));

	let resp = nson_write_multiple_abort(1, &existing);
	let transport = Arc::new(ScriptedTransport::new(vec![ScriptedResponse {
		status: 200,
		body: resp,
		set_cookie: None,
	}]));
	let client = Client::with_transport(config_with_transport(), transport).await.unwrap();

	let mut req = Request::new(Arc::new(nosqldb_core::op::WriteMultipleOp), opts(), ProtocolVersion::V4, 1);
	req.set_table_name("orders");
	req.abort_on_fail = true;
	for i in 1..=3 {
		let mut row = MapValue::new();
		row.insert("id", FieldValue::Integer(i));
		req.sub_operations.push(WriteSubOp {
			is_put: true,
			if_absent: i == 2,
			return_existing: true,
			row,
		});
	}

	let result = client.execute(req).await.unwrap();
	match result {
		OpResult::WriteMultiple {
			success,
			failed_op_index,
			results,
		} => {
			assert!(!success);
			assert_eq!(failed_op_index, Some(1));
			assert_eq!(results.len(), 1);
			assert!(!results[0].success);
			assert_eq!(results[0].existing_value, Some(existing));
		}
		other => panic!("unexpected result: {other:?}"),
	}
}

/// §8 item 15 — Scenario E: `CreateTable` followed by polling `GetTable`
/// observes a state sequence that is a subsequence of `CREATING -> ACTIVE`
/// with no other intermediate state.
#[tokio::test]
async fn scenario_e_ddl_completion_polling() {
	let transport = Arc::new(ScriptedTransport::new(vec![
		ScriptedResponse {
			status: 200,
			body: nson_table_result("orders", TableState::Creating),
			set_cookie: None,
		},
		ScriptedResponse {
			status: 200,
			body: nson_table_result("orders", TableState::Creating),
			set_cookie: None,
		},
		ScriptedResponse {
			status: 200,
			body: nson_table_result("orders", TableState::Active),
			set_cookie: None,
		},
	]));
	let client = Client::with_transport(config_with_transport(), transport).await.unwrap();

	let mut ddl_req = Request::new(Arc::new(TableRequestOp), opts(), ProtocolVersion::V4, 1);
	ddl_req.statement = Some("CREATE TABLE orders(id INTEGER, PRIMARY KEY(id))".to_string());
	let ddl_result = client.execute(ddl_req).await.unwrap();
	let mut observed = vec![match ddl_result {
		OpResult::Table { state, .. } => state,
		other => panic!("unexpected result: {other:?}"),
	}];

	loop {
		let mut req = Request::new(Arc::new(nosqldb_core::op::GetTableOp), opts(), ProtocolVersion::V4, 1);
		req.set_table_name("orders");
		match client.execute(req).await.unwrap() {
			OpResult::Table { state, .. } => {
				observed.push(state);
				if state == TableState::Active {
					break;
				}
			}
			other => panic!("unexpected result: {other:?}"),
		}
		assert!(observed.len() <= 10, "polling did not converge");
	}

	// The observed sequence must be a subsequence of CREATING -> ACTIVE: once
	// ACTIVE is seen it never reverts, and no other state appears.
	let mut saw_active = false;
	for state in &observed {
		match state {
			TableState::Creating => assert!(!saw_active, "CREATING observed after ACTIVE"),
			TableState::Active => saw_active = true,
			other => panic!("unexpected intermediate table state: {other:?}"),
		}
	}
	assert!(saw_active, "polling loop exited without observing ACTIVE");
}
