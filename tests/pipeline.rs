// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end pipeline scenarios: submit, stream, reconnect, live sessions.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{BOUNDARY, bearer, multipart_body, test_app, wav_bytes};
use futures::StreamExt;
use scriba_server::stream::{StreamEvent, StreamSettings, stream_job};
use std::time::Duration;
use uuid::Uuid;

fn fast_stream() -> StreamSettings {
    StreamSettings {
        poll_interval: Duration::from_millis(5),
        heartbeat_after: Duration::from_millis(500),
    }
}

fn submit_request(token: &str, body: Vec<u8>) -> Request<Body> {
    Request::post("/transcribe")
        .header(header::AUTHORIZATION, bearer(token))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn submit_stream_complete_then_detail() {
    let app = test_app(|_| {}).await;
    let (owner, token) = app.signed_up_user().await;

    let body = multipart_body(
        "demo.wav",
        "audio/wav",
        &wav_bytes(1.0),
        &[("profile", "balanced"), ("language", "en"), ("title", "demo")],
    );
    let (status, submitted) = app.json(submit_request(&token, body)).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{submitted}");
    assert_eq!(submitted["status"], "queued");
    let job_id = submitted["job_id"].as_str().unwrap().to_string();
    let transcript_id = submitted["transcript_id"].as_str().unwrap().to_string();

    let events: Vec<StreamEvent> =
        stream_job(app.state.queue.clone(), job_id, owner, fast_stream())
            .collect()
            .await;

    let deltas = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Delta(_)))
        .count();
    assert!(deltas >= 1, "expected at least one delta: {events:?}");

    let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminals.len(), 1);
    match events.last().unwrap() {
        StreamEvent::Completed {
            language,
            duration,
            quality_profile,
            transcript_key,
            ..
        } => {
            assert_eq!(language.as_deref(), Some("en"));
            assert!((duration.unwrap() - 1.0).abs() < 0.05, "duration {duration:?}");
            assert_eq!(quality_profile.as_deref(), Some("balanced"));
            assert!(transcript_key.is_some());
        }
        other => panic!("expected completed, got {other:?}"),
    }

    // The library detail carries segments and a presigned URL.
    let (status, detail) = app
        .json(
            Request::get(format!("/transcripts/{transcript_id}"))
                .header(header::AUTHORIZATION, bearer(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{detail}");
    assert_eq!(detail["status"], "completed");
    assert!(!detail["segments"].as_array().unwrap().is_empty());
    assert!(detail["transcript_url"].as_str().is_some());
}

#[tokio::test]
async fn disconnected_subscriber_does_not_stop_the_worker() {
    let app = test_app(|_| {}).await;
    let (owner, token) = app.signed_up_user().await;

    let body = multipart_body("demo.wav", "audio/wav", &wav_bytes(1.5), &[]);
    let (_, submitted) = app.json(submit_request(&token, body)).await;
    let job_id = submitted["job_id"].as_str().unwrap().to_string();
    let transcript_id: Uuid = submitted["transcript_id"].as_str().unwrap().parse().unwrap();

    // First subscriber reads at most one frame, then disconnects.
    {
        let mut stream = Box::pin(stream_job(
            app.state.queue.clone(),
            job_id.clone(),
            owner,
            fast_stream(),
        ));
        let _ = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        // Dropped here.
    }

    // The worker still runs the job to completion.
    app.drain_queue().await;
    let job = app
        .state
        .catalog
        .fetch_job(transcript_id, owner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, scriba_core::JobState::Completed);
    assert!(job.invariants_hold());

    // A reconnecting subscriber receives the terminal frame.
    let events: Vec<StreamEvent> =
        stream_job(app.state.queue.clone(), job_id, owner, fast_stream())
            .collect()
            .await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], StreamEvent::Completed { .. }));
}

#[tokio::test]
async fn stream_of_unknown_job_is_a_single_error() {
    let app = test_app(|_| {}).await;
    let (owner, _) = app.signed_up_user().await;
    let events: Vec<StreamEvent> = stream_job(
        app.state.queue.clone(),
        "no-such-job".into(),
        owner,
        fast_stream(),
    )
    .collect()
    .await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        StreamEvent::Error { detail, .. } if detail == "job-not-found"
    ));
}

#[tokio::test]
async fn live_session_chunks_finalize_into_a_completed_job() {
    let app = test_app(|_| {}).await;
    let (owner, token) = app.signed_up_user().await;

    let (status, created) = app
        .json(
            Request::post("/transcriptions/live/sessions")
                .header(header::AUTHORIZATION, bearer(&token))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::json!({"language": "es"}).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let session_id = created["session_id"].as_str().unwrap().to_string();

    for chunk in 0..2 {
        let body = multipart_body("chunk.wav", "audio/wav", &wav_bytes(1.0), &[]);
        let (status, outcome) = app
            .json(
                Request::post(format!(
                    "/transcriptions/live/sessions/{session_id}/chunk"
                ))
                .header(header::AUTHORIZATION, bearer(&token))
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(Body::from(body))
                .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "chunk {chunk}: {outcome}");
        assert_eq!(outcome["chunk_count"], chunk + 1);
    }

    let (status, finalized) = app
        .json(
            Request::post(format!(
                "/transcriptions/live/sessions/{session_id}/finalize"
            ))
            .header(header::AUTHORIZATION, bearer(&token))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::json!({"title": "en vivo"}).to_string()))
            .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{finalized}");
    assert_eq!(finalized["status"], "completed");
    let duration = finalized["duration"].as_f64().unwrap();
    assert!((duration - 2.0).abs() < 0.05, "duration {duration}");
    assert!(!finalized["text"].as_str().unwrap().is_empty());

    // The row is in the owner's library and the session is gone.
    let job_id: Uuid = finalized["transcription_id"].as_str().unwrap().parse().unwrap();
    let job = app
        .state
        .catalog
        .fetch_job(job_id, owner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, scriba_core::JobState::Completed);

    let body = multipart_body("chunk.wav", "audio/wav", &wav_bytes(0.5), &[]);
    let (status, _) = app
        .json(
            Request::post(format!(
                "/transcriptions/live/sessions/{session_id}/chunk"
            ))
            .header(header::AUTHORIZATION, bearer(&token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn live_discard_removes_the_session() {
    let app = test_app(|_| {}).await;
    let (_, token) = app.signed_up_user().await;

    let (_, created) = app
        .json(
            Request::post("/transcriptions/live/sessions")
                .header(header::AUTHORIZATION, bearer(&token))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}".to_string()))
                .unwrap(),
        )
        .await;
    let session_id = created["session_id"].as_str().unwrap().to_string();

    let response = app
        .request(
            Request::delete(format!("/transcriptions/live/sessions/{session_id}"))
                .header(header::AUTHORIZATION, bearer(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(app.state.live.session_count().await, 0);
}
