//! End-to-end tests for the announcement pipeline.
//!
//! Drives the HTTP router the way the dispatcher page does:
//! HTTP → sequencer → voice session → (mock) playback → completion events,
//! plus the departure endpoints.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::departures::DepartureRegistry;
    use crate::routes::{Route, RouteDirectory};
    use crate::server::{router, AppState};
    use crate::station::StationAudioResolver;
    use crate::voice::mock::MockVoiceBackend;
    use crate::voice::{
        AnnouncementSequencer, AnnouncementState, PlaybackOutcome, SequencerOptions,
        VoiceBackend, VoiceSessionManager,
    };

    // ── Test Helpers ─────────────────────────────────────────────

    struct Harness {
        app: Router,
        backend: MockVoiceBackend,
        sequencer: Arc<AnnouncementSequencer>,
        _audio: tempfile::TempDir,
    }

    fn harness(files: &[&str]) -> Harness {
        harness_with(files, SequencerOptions::default())
    }

    fn harness_with(files: &[&str], options: SequencerOptions) -> Harness {
        let audio = tempfile::tempdir().unwrap();
        for f in files {
            std::fs::write(audio.path().join(f), b"ID3").unwrap();
        }

        let routes = Arc::new(
            RouteDirectory::new(vec![
                Route {
                    id: "Lijn 6".into(),
                    channel_id: 70,
                    stops: vec![
                        "Spawn".into(),
                        "Centraal Station".into(),
                        "Transferium".into(),
                    ],
                },
                Route {
                    id: "Line A".into(),
                    channel_id: 70,
                    stops: vec!["Spawn".into(), "Harbour".into()],
                },
                Route {
                    id: "FastLine".into(),
                    channel_id: 80,
                    stops: vec!["Spawn".into(), "Airport".into()],
                },
            ])
            .unwrap(),
        );

        let backend = MockVoiceBackend::new();
        let dyn_backend: Arc<dyn VoiceBackend> = Arc::new(backend.clone());
        let sessions = VoiceSessionManager::new(dyn_backend, Arc::clone(&routes));
        let resolver = StationAudioResolver::new(audio.path(), "mp3", "last_station.mp3");
        let sequencer = AnnouncementSequencer::spawn(sessions, routes, resolver, options);

        let app = router(AppState {
            sequencer: Arc::clone(&sequencer),
            departures: Arc::new(DepartureRegistry::new()),
        });

        Harness {
            app,
            backend,
            sequencer,
            _audio: audio,
        }
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, value)
    }

    async fn next_station(app: &Router, route: &str, station: &str) -> (StatusCode, Value) {
        let body = json!({ "routeName": route, "stationName": station }).to_string();
        send(app, Method::POST, "/next-station", Some(&body)).await
    }

    async fn wait_for(
        sequencer: &AnnouncementSequencer,
        pred: impl FnMut(&AnnouncementState) -> bool,
    ) -> AnnouncementState {
        let mut rx = sequencer.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
        state.clone()
    }

    // ── Announcements ────────────────────────────────────────────

    #[tokio::test]
    async fn test_non_final_stop_plays_and_stays_connected() {
        let h = harness(&["spawn.mp3", "last_station.mp3"]);

        let (status, body) = next_station(&h.app, "Lijn 6", "Spawn").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true, "message": "Playing Spawn" }));
        assert_eq!(h.backend.joins(), vec![70]);

        h.backend.finish_latest();
        wait_for(&h.sequencer, |s| matches!(s, AnnouncementState::Standby { .. })).await;

        assert_eq!(h.backend.played_files(), vec!["spawn.mp3".to_string()]);
        assert!(h.backend.disconnects().is_empty());

        let (_, status) = send(&h.app, Method::GET, "/status", None).await;
        assert_eq!(status["state"], "standby");
        assert_eq!(status["channelId"], "70");
    }

    #[tokio::test]
    async fn test_final_stop_plays_last_station_then_leaves() {
        let h = harness(&["transferium.mp3", "last_station.mp3"]);

        let (status, _) = next_station(&h.app, "Lijn 6", "Transferium").await;
        assert_eq!(status, StatusCode::OK);

        h.backend.finish_latest();
        wait_for(&h.sequencer, |s| {
            matches!(s, AnnouncementState::PlayingFinalClip { .. })
        })
        .await;
        assert!(h.backend.disconnects().is_empty());

        h.backend.finish_latest();
        wait_for(&h.sequencer, |s| *s == AnnouncementState::Disconnected).await;

        assert_eq!(
            h.backend.played_files(),
            vec!["transferium.mp3".to_string(), "last_station.mp3".to_string()]
        );
        assert_eq!(h.backend.disconnects(), vec![70]);
        assert_eq!(h.backend.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_whole_line_reuses_one_session() {
        let h = harness(&[
            "spawn.mp3",
            "Centraal-Station.mp3",
            "transferium.mp3",
            "last_station.mp3",
        ]);

        for station in ["Spawn", "Centraal Station"] {
            let (status, _) = next_station(&h.app, "Lijn 6", station).await;
            assert_eq!(status, StatusCode::OK);
            h.backend.finish_latest();
            wait_for(&h.sequencer, |s| matches!(s, AnnouncementState::Standby { .. })).await;
        }

        next_station(&h.app, "Lijn 6", "Transferium").await;
        h.backend.finish_latest();
        wait_for(&h.sequencer, |s| {
            matches!(s, AnnouncementState::PlayingFinalClip { .. })
        })
        .await;
        h.backend.finish_latest();
        wait_for(&h.sequencer, |s| *s == AnnouncementState::Disconnected).await;

        assert_eq!(h.backend.joins(), vec![70]);
        assert_eq!(h.backend.disconnects(), vec![70]);
        assert_eq!(
            h.backend.played_files(),
            vec![
                "spawn.mp3".to_string(),
                "Centraal-Station.mp3".to_string(),
                "transferium.mp3".to_string(),
                "last_station.mp3".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_request_aliases_accepted() {
        let h = harness(&["spawn.mp3"]);
        let body = json!({ "route": "lijn 6", "station": "Spawn" }).to_string();
        let (status, body) = send(&h.app, Method::POST, "/next-station", Some(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn test_switching_channel_replaces_session() {
        let h = harness(&["spawn.mp3"]);

        next_station(&h.app, "Lijn 6", "Spawn").await;
        next_station(&h.app, "FastLine", "Spawn").await;

        assert_eq!(h.backend.joins(), vec![70, 80]);
        assert_eq!(h.backend.disconnects(), vec![70]);
        assert_eq!(h.backend.live_connections(), 1);

        // The first chain was superseded; its completion must not tear down
        // the new session.
        h.backend.complete_step(0, PlaybackOutcome::Finished);
        h.backend.finish_latest();
        wait_for(&h.sequencer, |s| matches!(s, AnnouncementState::Standby { .. })).await;
        assert_eq!(h.backend.disconnects(), vec![70]);
        assert_eq!(h.sequencer.connected_channel(), Some(80));
    }

    #[tokio::test]
    async fn test_shared_channel_routes_do_not_rejoin() {
        let h = harness(&["spawn.mp3"]);

        next_station(&h.app, "Lijn 6", "Spawn").await;
        next_station(&h.app, "Line A", "Spawn").await;

        assert_eq!(h.backend.joins(), vec![70]);
        assert!(h.backend.disconnects().is_empty());
    }

    #[tokio::test]
    async fn test_externally_dropped_session_is_rejoined() {
        let h = harness(&["spawn.mp3", "centraal_station.mp3"]);

        next_station(&h.app, "Lijn 6", "Spawn").await;
        h.backend.finish_latest();
        wait_for(&h.sequencer, |s| matches!(s, AnnouncementState::Standby { .. })).await;

        // Kicked from the channel while idling in Standby.
        h.backend.sever_connections();

        let (status, body) = next_station(&h.app, "Lijn 6", "Centraal Station").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(h.backend.joins(), vec![70, 70]);
        assert_eq!(h.backend.max_live(), 1);
        assert_eq!(
            h.backend.played_files(),
            vec!["spawn.mp3".to_string(), "centraal_station.mp3".to_string()]
        );
        assert_eq!(h.backend.plays()[1].channel_id, 70);
    }

    #[tokio::test]
    async fn test_disconnect_after_each_stop() {
        let h = harness_with(
            &["spawn.mp3"],
            SequencerOptions {
                disconnect_after_each_stop: true,
                playback_timeout: None,
            },
        );

        next_station(&h.app, "Lijn 6", "Spawn").await;
        h.backend.finish_latest();
        wait_for(&h.sequencer, |s| *s == AnnouncementState::Disconnected).await;
        assert_eq!(h.backend.disconnects(), vec![70]);
    }

    // ── Error responses ──────────────────────────────────────────

    #[tokio::test]
    async fn test_missing_station_is_400_without_joining() {
        let h = harness(&["spawn.mp3"]);

        let body = json!({ "routeName": "Lijn 6" }).to_string();
        let (status, body) = send(&h.app, Method::POST, "/next-station", Some(&body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Missing"));
        assert!(h.backend.joins().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_json_is_400() {
        let h = harness(&["spawn.mp3"]);
        let (status, body) = send(&h.app, Method::POST, "/next-station", Some("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let h = harness(&["spawn.mp3"]);
        let (status, body) = next_station(&h.app, "Lijn 99", "Spawn").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Unknown route: Lijn 99");
        assert!(h.backend.joins().is_empty());
    }

    #[tokio::test]
    async fn test_missing_audio_is_404_and_keeps_session() {
        let h = harness(&["spawn.mp3"]);

        next_station(&h.app, "Lijn 6", "Spawn").await;
        let (status, body) = next_station(&h.app, "Lijn 6", "Nowhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Audio file not found for station Nowhere");
        assert!(h.backend.disconnects().is_empty());
        assert_eq!(h.sequencer.connected_channel(), Some(70));

        let (_, status) = send(&h.app, Method::GET, "/status", None).await;
        assert_eq!(status["state"], "error");
        assert_eq!(status["kind"], "audio_not_found");
    }

    #[tokio::test]
    async fn test_deleted_channel_is_404() {
        let h = harness(&["spawn.mp3"]);
        h.backend.remove_channel(80);

        let (status, body) = next_station(&h.app, "FastLine", "Spawn").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Voice channel not found for route FastLine");
        assert!(h.backend.joins().is_empty());
    }

    #[tokio::test]
    async fn test_join_failure_is_500() {
        let h = harness(&["spawn.mp3"]);
        h.backend.fail_joins(true);

        let (status, body) = next_station(&h.app, "Lijn 6", "Spawn").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(
            body["error"]
                .as_str()
                .unwrap()
                .starts_with("Failed to join voice channel")
        );
        assert_eq!(h.backend.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_playback_failure_tears_down() {
        let h = harness(&["spawn.mp3"]);

        next_station(&h.app, "Lijn 6", "Spawn").await;
        h.backend
            .complete_latest(PlaybackOutcome::Failed("decoder error".into()));
        wait_for(&h.sequencer, |s| matches!(s, AnnouncementState::Error { .. })).await;

        assert_eq!(h.backend.disconnects(), vec![70]);
        assert_eq!(h.sequencer.connected_channel(), None);
    }

    // ── Departures ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_departure_upsert_list_reset() {
        let h = harness(&[]);

        let report = json!({ "routeName": "Lijn 6", "driver": "Alex", "departTime": "14:05" });
        let (status, body) =
            send(&h.app, Method::POST, "/departures", Some(&report.to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true }));

        let update = json!({ "routeName": "Lijn 6", "driver": "Sam", "departTime": "14:20" });
        send(&h.app, Method::POST, "/api/departures", Some(&update.to_string())).await;
        let other = json!({ "routeName": "FastLine", "driver": "Kim", "departTime": "15:00" });
        send(&h.app, Method::POST, "/departures", Some(&other.to_string())).await;

        let (status, list) = send(&h.app, Method::GET, "/departures", None).await;
        assert_eq!(status, StatusCode::OK);
        let list = list.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["routeName"], "FastLine");
        assert_eq!(list[1]["routeName"], "Lijn 6");
        assert_eq!(list[1]["driver"], "Sam");
        assert_eq!(list[1]["departTime"], "14:20");
        assert!(list[1]["reportedAt"].is_string());

        let (status, body) = send(&h.app, Method::POST, "/reset", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true }));

        let (_, list) = send(&h.app, Method::GET, "/api/departures", None).await;
        assert_eq!(list, json!([]));
    }

    #[tokio::test]
    async fn test_departure_missing_driver_is_400() {
        let h = harness(&[]);
        let report = json!({ "routeName": "Lijn 6", "departTime": "14:05" });
        let (status, body) =
            send(&h.app, Method::POST, "/departures", Some(&report.to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (_, list) = send(&h.app, Method::GET, "/departures", None).await;
        assert_eq!(list, json!([]));
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(&[]);
        let (status, body) = send(&h.app, Method::GET, "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("Station announcer is running".into()));
    }
}
