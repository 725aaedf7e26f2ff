//! End-to-end protocol flows: scripted host sessions against the bulk
//! engine with a real backing directory underneath.

mod common;

use common::{cmd, data, parse_handle_array, run_engine, upload_info, Step};
use ptpd::proto::{container, format, op, resp, ObjectInfo, MODEL_DIR, PARAM_ANY, STORE_ID};
use ptpd::store::ObjectStore;
use std::fs;
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> ObjectStore {
    ObjectStore::open(dir.path()).expect("backing directory")
}

#[test]
fn test_session_lifecycle() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[7]),
            cmd(op::CLOSE_SESSION, 2, &[]),
            cmd(op::CLOSE_SESSION, 3, &[]),
        ],
    );
    run.result.as_ref().unwrap();

    let (open, _) = run.container(0);
    assert_eq!(open.kind, container::RESPONSE);
    assert_eq!(open.code, resp::OK);
    assert_eq!(open.id, 1);
    assert_eq!(open.length, 12);

    let (close, _) = run.container(1);
    assert_eq!(close.code, resp::OK);
    assert_eq!(close.id, 2);

    // Second close: already closed.
    let (again, _) = run.container(2);
    assert_eq!(again.code, resp::SESSION_NOT_OPEN);
    assert_eq!(again.id, 3);
}

#[test]
fn test_empty_store_enumeration() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::GET_OBJECT_HANDLES, 2, &[STORE_ID, 0, PARAM_ANY]),
        ],
    );
    run.result.as_ref().unwrap();

    let (data_hdr, payload) = run.container(1);
    assert_eq!(data_hdr.kind, container::DATA);
    assert_eq!(data_hdr.code, op::GET_OBJECT_HANDLES);
    assert_eq!(data_hdr.id, 2);
    assert_eq!(parse_handle_array(payload), [1, 2]);

    let (response, _) = run.container(2);
    assert_eq!(response.code, resp::OK);
    assert_eq!(response.id, 2);
}

#[test]
fn test_upload_round_trip() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::SEND_OBJECT_INFO, 2, &[STORE_ID, 2]),
            data(
                op::SEND_OBJECT_INFO,
                2,
                &upload_info("IMG.JPG", format::EXIF_JPEG, 5),
            ),
            cmd(op::SEND_OBJECT, 3, &[]),
            data(op::SEND_OBJECT, 3, b"HELLO"),
            cmd(op::GET_OBJECT, 4, &[3]),
        ],
    );
    run.result.as_ref().unwrap();

    // SendObjectInfo answers with (store, parent, new handle).
    let (info_resp, info_params) = run.container(1);
    assert_eq!(info_resp.code, resp::OK);
    assert_eq!(info_resp.id, 2);
    let mut expected = Vec::new();
    for p in [STORE_ID, 2, 3] {
        expected.extend_from_slice(&p.to_le_bytes());
    }
    assert_eq!(info_params, &expected);

    let (send_resp, _) = run.container(2);
    assert_eq!(send_resp.code, resp::OK);
    assert_eq!(send_resp.id, 3);

    // The object landed on disk and the lock file is gone.
    assert_eq!(fs::read(dir.path().join("IMG.JPG")).unwrap(), b"HELLO");
    assert!(!dir.path().join("IMG.JPG.lock").exists());

    // GetObject returns the bytes in a data container.
    let (obj_data, obj_payload) = run.container(3);
    assert_eq!(obj_data.kind, container::DATA);
    assert_eq!(obj_data.length, 12 + 5);
    assert_eq!(obj_payload, b"HELLO");
    let (obj_resp, _) = run.container(4);
    assert_eq!(obj_resp.code, resp::OK);
    assert_eq!(obj_resp.id, 4);
}

#[test]
fn test_delete_then_reenumerate() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("IMG.JPG"), b"HELLO").unwrap();

    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::DELETE_OBJECT, 2, &[3, 0]),
            cmd(op::GET_OBJECT_HANDLES, 3, &[STORE_ID, 0, PARAM_ANY]),
        ],
    );
    run.result.as_ref().unwrap();

    let (del, _) = run.container(1);
    assert_eq!(del.code, resp::OK);
    assert_eq!(del.id, 2);
    assert!(!dir.path().join("IMG.JPG").exists());

    let (_, handles) = run.container(2);
    assert_eq!(parse_handle_array(handles), [1, 2]);

    // Deleting an already-deleted handle is an error.
    let run = run_engine(
        run.store,
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::DELETE_OBJECT, 2, &[3, 0]),
        ],
    );
    run.result.as_ref().unwrap();
    assert_eq!(run.container(1).0.code, resp::INVALID_OBJECT_HANDLE);
}

#[test]
fn test_reset_mid_session_closes_it() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[7]),
            // Device reset interrupts the blocked read; the engine
            // parks on the gate, resumes, and serves new commands.
            Step::Reset,
            cmd(op::GET_OBJECT_HANDLES, 2, &[STORE_ID, 0, PARAM_ANY]),
            cmd(op::OPEN_SESSION, 3, &[9]),
        ],
    );
    run.result.as_ref().unwrap();

    assert_eq!(run.container(0).0.code, resp::OK);
    // The reset closed the session, so the handle query is refused...
    let (refused, _) = run.container(1);
    assert_eq!(refused.code, resp::SESSION_NOT_OPEN);
    assert_eq!(refused.id, 2);
    // ...and a fresh OpenSession succeeds instead of reporting the
    // stale session id.
    let (reopened, _) = run.container(2);
    assert_eq!(reopened.code, resp::OK);
    assert_eq!(reopened.id, 3);
}

#[test]
fn test_get_object_info_synthetic_directories() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::GET_OBJECT_INFO, 2, &[1]),
            cmd(op::GET_OBJECT_INFO, 3, &[2]),
            cmd(op::GET_OBJECT_INFO, 4, &[99]),
        ],
    );
    run.result.as_ref().unwrap();

    let (hdr, payload) = run.container(1);
    assert_eq!(hdr.kind, container::DATA);
    let dcim = ObjectInfo::decode(payload).unwrap();
    assert_eq!(dcim.filename, "DCIM");
    assert_eq!(dcim.object_format, format::ASSOCIATION);
    assert_eq!(dcim.parent_object, 0);
    assert_eq!(dcim.object_compressed_size, 4096);

    let (_, payload) = run.container(3);
    let model = ObjectInfo::decode(payload).unwrap();
    assert_eq!(model.filename, MODEL_DIR);
    assert_eq!(model.parent_object, 1);
    assert_eq!(model.association_type, 1);

    let (unknown, _) = run.container(5);
    assert_eq!(unknown.code, resp::INVALID_OBJECT_HANDLE);
    assert_eq!(unknown.id, 4);
}

#[test]
fn test_get_object_info_real_file() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("PHOTO.JPG"), b"abcdef").unwrap();

    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::GET_OBJECT_INFO, 2, &[3]),
        ],
    );
    run.result.as_ref().unwrap();

    let (_, payload) = run.container(1);
    let info = ObjectInfo::decode(payload).unwrap();
    assert_eq!(info.filename, "PHOTO.JPG");
    assert_eq!(info.object_format, format::EXIF_JPEG);
    assert_eq!(info.object_compressed_size, 6);
    assert_eq!(info.storage_id, STORE_ID);
    assert_eq!(info.parent_object, 2);
    assert!(info.capture_date.ends_with(".0Z"));
    assert_eq!(info.modification_date, "");
    assert_eq!(info.keywords, "");
}

#[test]
fn test_device_info_without_session() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(open_store(&dir), vec![cmd(op::GET_DEVICE_INFO, 1, &[])]);
    run.result.as_ref().unwrap();

    let (hdr, payload) = run.container(0);
    assert_eq!(hdr.kind, container::DATA);
    assert_eq!(hdr.id, 1);
    assert_eq!(hdr.length as usize, 12 + payload.len());
    // Operations array: 13 supported codes starting at GetDeviceInfo.
    assert_eq!(&payload[11..15], &13u32.to_le_bytes());
    assert_eq!(run.container(1).0.code, resp::OK);
}

#[test]
fn test_storage_queries() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::GET_STORAGE_IDS, 2, &[]),
            cmd(op::GET_STORAGE_INFO, 3, &[STORE_ID]),
            cmd(op::GET_STORAGE_INFO, 4, &[0x99999999]),
        ],
    );
    run.result.as_ref().unwrap();

    let (ids_hdr, ids) = run.container(1);
    assert_eq!(ids_hdr.kind, container::DATA);
    assert_eq!(parse_handle_array(ids), [STORE_ID]);

    let (info_hdr, info) = run.container(3);
    assert_eq!(info_hdr.kind, container::DATA);
    // Removable RAM, DCF, read-write; then capacity and free space.
    assert_eq!(&info[0..2], &4u16.to_le_bytes());
    assert_eq!(&info[2..4], &3u16.to_le_bytes());
    assert_eq!(&info[4..6], &0u16.to_le_bytes());
    let capacity = u64::from_le_bytes(info[6..14].try_into().unwrap());
    let free = u64::from_le_bytes(info[14..22].try_into().unwrap());
    assert!(capacity > 0 && free <= capacity);

    // Unknown storage id: response only, no data container.
    let (bad, _) = run.container(5);
    assert_eq!(bad.kind, container::RESPONSE);
    assert_eq!(bad.code, resp::INVALID_STORAGE_ID);
    assert_eq!(bad.id, 4);
}

#[test]
fn test_object_handles_per_parent() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.jpg"), b"1").unwrap();
    fs::write(dir.path().join("b.jpg"), b"2").unwrap();

    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::GET_OBJECT_HANDLES, 2, &[STORE_ID, 0, 2]),
            cmd(op::GET_OBJECT_HANDLES, 3, &[STORE_ID]),
            cmd(op::GET_OBJECT_HANDLES, 4, &[STORE_ID, 0, 3]),
        ],
    );
    run.result.as_ref().unwrap();

    // Parent 2: real objects only.
    let mut inside = parse_handle_array(&run.container(1).1);
    inside.sort_unstable();
    assert_eq!(inside, [3, 4]);

    // No parent given: synthetic directories first, then the objects.
    let all = parse_handle_array(&run.container(3).1);
    assert_eq!(&all[..2], &[1, 2]);
    assert_eq!(all.len(), 4);

    // A real object is not a valid parent.
    assert_eq!(run.container(5).0.code, resp::INVALID_PARENT_OBJECT);
}

#[test]
fn test_large_object_data_phase_length() {
    let dir = TempDir::new().unwrap();
    let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(dir.path().join("big.jpg"), &body).unwrap();

    let run = run_engine(
        open_store(&dir),
        vec![cmd(op::OPEN_SESSION, 1, &[1]), cmd(op::GET_OBJECT, 2, &[3])],
    );
    run.result.as_ref().unwrap();

    let (hdr, payload) = run.container(1);
    assert_eq!(hdr.kind, container::DATA);
    assert_eq!(hdr.length as usize, 12 + body.len());
    assert_eq!(payload, &body);
    assert_eq!(run.container(2).0.code, resp::OK);
}

#[test]
fn test_upload_size_mismatch_short() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::SEND_OBJECT_INFO, 2, &[STORE_ID, 2]),
            data(
                op::SEND_OBJECT_INFO,
                2,
                &upload_info("S.JPG", format::EXIF_JPEG, 10),
            ),
            cmd(op::SEND_OBJECT, 3, &[]),
            data(op::SEND_OBJECT, 3, b"HELLO"),
        ],
    );
    run.result.as_ref().unwrap();

    assert_eq!(run.container(2).0.code, resp::INCOMPLETE_TRANSFER);
    // The slot survives for a retry after the next SendObjectInfo.
    assert!(run.store.has_pending());
}

#[test]
fn test_upload_size_mismatch_long() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::SEND_OBJECT_INFO, 2, &[STORE_ID, 2]),
            data(
                op::SEND_OBJECT_INFO,
                2,
                &upload_info("L.JPG", format::EXIF_JPEG, 2),
            ),
            cmd(op::SEND_OBJECT, 3, &[]),
            data(op::SEND_OBJECT, 3, b"HELLO"),
            cmd(op::CLOSE_SESSION, 4, &[]),
        ],
    );
    run.result.as_ref().unwrap();

    assert_eq!(run.container(2).0.code, resp::STORE_FULL);
    // The oversized data phase was drained; the engine keeps serving.
    assert_eq!(run.container(3).0.code, resp::OK);
}

#[test]
fn test_upload_rejects_wrong_destination() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::SEND_OBJECT_INFO, 2, &[STORE_ID, 1]),
            data(
                op::SEND_OBJECT_INFO,
                2,
                &upload_info("D.JPG", format::EXIF_JPEG, 1),
            ),
        ],
    );
    run.result.as_ref().unwrap();
    assert_eq!(
        run.container(1).0.code,
        resp::SPECIFICATION_OF_DESTINATION_UNSUPPORTED
    );
    assert!(!dir.path().join("D.JPG").exists());
}

#[test]
fn test_upload_rejects_unsupported_format() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::SEND_OBJECT_INFO, 2, &[STORE_ID, 2]),
            data(
                op::SEND_OBJECT_INFO,
                2,
                &upload_info("P.PNG", format::PNG, 1),
            ),
        ],
    );
    run.result.as_ref().unwrap();
    assert_eq!(run.container(1).0.code, resp::INVALID_OBJECT_FORMAT_CODE);
}

#[test]
fn test_second_send_object_info_replaces_slot() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::SEND_OBJECT_INFO, 2, &[STORE_ID, 2]),
            data(
                op::SEND_OBJECT_INFO,
                2,
                &upload_info("ONE.JPG", format::EXIF_JPEG, 3),
            ),
            cmd(op::SEND_OBJECT_INFO, 3, &[STORE_ID, 2]),
            data(
                op::SEND_OBJECT_INFO,
                3,
                &upload_info("TWO.JPG", format::EXIF_JPEG, 3),
            ),
            cmd(op::SEND_OBJECT, 4, &[]),
            data(op::SEND_OBJECT, 4, b"abc"),
        ],
    );
    run.result.as_ref().unwrap();

    // The replacement got a fresh, higher handle.
    let (second, params) = run.container(2);
    assert_eq!(second.code, resp::OK);
    assert_eq!(&params[8..12], &4u32.to_le_bytes());

    // Only the second upload exists on disk.
    assert!(!dir.path().join("ONE.JPG").exists());
    assert_eq!(fs::read(dir.path().join("TWO.JPG")).unwrap(), b"abc");
    assert_eq!(run.store.lookup(4).unwrap().name, "TWO.JPG");
}

#[test]
fn test_empty_upload() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::SEND_OBJECT_INFO, 2, &[STORE_ID, 2]),
            data(
                op::SEND_OBJECT_INFO,
                2,
                &upload_info("EMPTY.TXT", format::TEXT, 0),
            ),
            cmd(op::SEND_OBJECT, 3, &[]),
            data(op::SEND_OBJECT, 3, b""),
        ],
    );
    run.result.as_ref().unwrap();

    assert_eq!(run.container(2).0.code, resp::OK);
    assert_eq!(fs::metadata(dir.path().join("EMPTY.TXT")).unwrap().len(), 0);
    assert!(!dir.path().join("EMPTY.TXT.lock").exists());
}

#[test]
fn test_delete_synthetic_directories_is_refused() {
    let dir = TempDir::new().unwrap();
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::DELETE_OBJECT, 2, &[1, 0]),
            cmd(op::DELETE_OBJECT, 3, &[2, 0]),
        ],
    );
    run.result.as_ref().unwrap();
    assert_eq!(run.container(1).0.code, resp::OBJECT_WRITE_PROTECTED);
    assert_eq!(run.container(2).0.code, resp::OBJECT_WRITE_PROTECTED);
}

#[test]
fn test_delete_all_objects() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.jpg"), b"1").unwrap();
    fs::write(dir.path().join("b.jpg"), b"2").unwrap();

    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::DELETE_OBJECT, 2, &[PARAM_ANY, 0]),
            cmd(op::GET_NUM_OBJECTS, 3, &[STORE_ID, 0, 2]),
        ],
    );
    run.result.as_ref().unwrap();

    assert_eq!(run.container(1).0.code, resp::OK);
    assert_eq!(run.container(2).1, 0u32.to_le_bytes());
    assert!(!dir.path().join("a.jpg").exists());
    assert!(!dir.path().join("b.jpg").exists());
}

#[test]
fn test_delete_by_format_is_unsupported() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.jpg"), b"1").unwrap();

    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, 1, &[1]),
            cmd(op::DELETE_OBJECT, 2, &[3, u32::from(format::EXIF_JPEG)]),
        ],
    );
    run.result.as_ref().unwrap();
    assert_eq!(
        run.container(1).0.code,
        resp::SPECIFICATION_BY_FORMAT_NOT_SUPPORTED
    );
    assert!(dir.path().join("a.jpg").exists());
}

#[test]
fn test_get_thumb_without_thumbnail_support() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.jpg"), b"1").unwrap();

    let run = run_engine(
        open_store(&dir),
        vec![cmd(op::OPEN_SESSION, 1, &[1]), cmd(op::GET_THUMB, 2, &[3])],
    );
    run.result.as_ref().unwrap();
    assert_eq!(run.container(1).0.code, resp::NO_THUMBNAIL_PRESENT);
}

#[test]
fn test_every_response_echoes_its_transaction_id() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.jpg"), b"1").unwrap();

    let ids = [10, 11, 12, 13, 14];
    let run = run_engine(
        open_store(&dir),
        vec![
            cmd(op::OPEN_SESSION, ids[0], &[1]),
            cmd(op::GET_STORAGE_IDS, ids[1], &[]),
            cmd(op::GET_OBJECT_HANDLES, ids[2], &[STORE_ID]),
            cmd(op::GET_OBJECT, ids[3], &[3]),
            cmd(op::CLOSE_SESSION, ids[4], &[]),
        ],
    );
    run.result.as_ref().unwrap();

    let responses = run.responses();
    assert_eq!(responses.len(), ids.len());
    for (response, id) in responses.iter().zip(ids) {
        assert_eq!(response.0.id, id);
    }
    // Every emitted container's length field covers exactly its bytes.
    for (header, payload) in &run.containers {
        assert_eq!(header.length as usize, 12 + payload.len());
    }
}
