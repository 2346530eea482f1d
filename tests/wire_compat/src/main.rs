fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use chunkup_protocol::{
        ApiEnvelope, ChunkUploadResponse, FileMetadata, InitChunkedRequest, InitChunkedResponse,
        MergeRequest, ServerProgress, ServerUploadStatus, UploadConfig,
    };
    use chunkup_uploader::TaskSnapshot;

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    fn parse_fixture<T: serde::de::DeserializeOwned>(name: &str) -> T {
        serde_json::from_value(load_fixture(name))
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"))
    }

    /// Makes `60` and `60.0` compare equal; the server writes whole
    /// percentages as integers.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture, re-serializes it and compares the JSON
    /// values (key-order independent, number-normalized).
    fn roundtrip_test<T>(name: &str)
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  server: {fixture}\n  client: {reserialized}"
        );
    }

    // --- Request bodies ---

    #[test]
    fn fixture_chunk_init_request() {
        roundtrip_test::<InitChunkedRequest>("chunk_init_request.json");
    }

    #[test]
    fn fixture_merge_request() {
        roundtrip_test::<MergeRequest>("merge_request.json");
    }

    // --- Response envelopes ---

    #[test]
    fn fixture_upload_config() {
        roundtrip_test::<ApiEnvelope<UploadConfig>>("upload_config.json");

        let config = parse_fixture::<ApiEnvelope<UploadConfig>>("upload_config.json")
            .into_data()
            .unwrap();
        assert_eq!(config.chunk_size, 2 * 1024 * 1024);
        assert!(config.allows_mime("video/mp4"));
        assert!(
            !config.allows_mime("application/x-msdownload"),
            "a type mapped to false is not allowed"
        );
        assert!(!config.allows_mime("text/html"));
    }

    #[test]
    fn fixture_chunk_init_response() {
        roundtrip_test::<ApiEnvelope<InitChunkedResponse>>("chunk_init_response.json");
    }

    #[test]
    fn server_empty_upload_token_means_none() {
        let resp = parse_fixture::<ApiEnvelope<InitChunkedResponse>>(
            "chunk_init_response_no_token.json",
        )
        .into_data()
        .unwrap();
        assert!(resp.upload_token().is_none());
        assert_eq!(resp.chunk_total, 5);
    }

    #[test]
    fn fixture_chunk_upload_response() {
        roundtrip_test::<ApiEnvelope<ChunkUploadResponse>>("chunk_upload_response.json");
    }

    #[test]
    fn fixture_merge_response() {
        roundtrip_test::<ApiEnvelope<FileMetadata>>("merge_response.json");

        let meta = parse_fixture::<ApiEnvelope<FileMetadata>>("merge_response.json")
            .into_data()
            .unwrap();
        assert_eq!(meta.uploaded_at.to_rfc3339(), "2024-05-01T02:20:30+00:00");
    }

    #[test]
    fn fixture_progress_response() {
        roundtrip_test::<ApiEnvelope<ServerProgress>>("progress_response.json");

        let progress = parse_fixture::<ApiEnvelope<ServerProgress>>("progress_response.json")
            .into_data()
            .unwrap();
        assert_eq!(progress.status, ServerUploadStatus::Uploading);
        assert_eq!(progress.chunk_uploaded, 3);
    }

    #[test]
    fn fixture_error_response() {
        roundtrip_test::<ApiEnvelope<FileMetadata>>("error_response.json");

        let err = parse_fixture::<ApiEnvelope<FileMetadata>>("error_response.json")
            .into_data()
            .unwrap_err();
        assert_eq!(err.code, 400);
        assert_eq!(err.message, "file type not allowed");
        assert!(!err.is_unauthorized());
    }

    #[test]
    fn fixture_unauthorized_response() {
        let err = parse_fixture::<ApiEnvelope<UploadConfig>>("unauthorized_response.json")
            .into_data()
            .unwrap_err();
        assert!(err.is_unauthorized());
    }

    // --- Client-side persisted state ---

    #[test]
    fn fixture_task_snapshot() {
        roundtrip_test::<TaskSnapshot>("task_snapshot.json");

        let snapshot = parse_fixture::<TaskSnapshot>("task_snapshot.json");
        let uploaded: Vec<u32> = snapshot
            .chunks
            .iter()
            .filter(|c| c.uploaded)
            .map(|c| c.index)
            .collect();
        assert_eq!(uploaded, [0, 1]);
        assert_eq!(snapshot.chunks[2].attempts, 2);
    }
}
