//! Screen automation against a scripted display

use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use sightline_common::config::RecordingConfig;
use sightline_common::Error;
use sightline_screen::testing::{pattern, screen, Action, FakeChannel};
use sightline_screen::{
    Button, ImageCatalog, Key, KeyCode, KeyInput, NccMatcher, ReferenceImage, Session,
    SessionSettings, Target,
};

fn settings() -> SessionSettings {
    SessionSettings {
        poll_interval: Duration::from_millis(250),
        find_timeout: Duration::from_secs(10),
        wait_timeout: Duration::from_secs(30),
        typing_delay: Duration::from_millis(100),
        double_click_gap: Duration::from_millis(100),
        recording: RecordingConfig {
            ffmpeg: "/nonexistent/ffmpeg".to_string(),
            ..Default::default()
        },
    }
}

/// Catalog with "alpha" and "beta", 16x16 each; beta is clicked 4px right of centre
fn catalog() -> ImageCatalog {
    let mut catalog = ImageCatalog::new();
    catalog.insert(ReferenceImage::from_image(
        "alpha",
        &DynamicImage::ImageLuma8(pattern(16, 16, 1)),
    ));
    catalog.insert(
        ReferenceImage::from_image("beta", &DynamicImage::ImageLuma8(pattern(16, 16, 2)))
            .with_focus_delta(4, 0),
    );
    catalog
}

fn session(channel: &FakeChannel) -> Session {
    Session::new(
        Box::new(channel.clone()),
        Box::new(NccMatcher::new()),
        catalog(),
        settings(),
    )
}

fn beta_screen() -> DynamicImage {
    screen(160, 120, &[(&pattern(16, 16, 2), 60, 30)])
}

#[tokio::test(start_paused = true)]
async fn find_returns_first_present_candidate_in_one_cycle() {
    let channel = FakeChannel::showing(beta_screen());
    let mut session = session(&channel);

    let found = session
        .find(vec!["alpha", "beta"], Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(found.image.name(), "beta");
    assert_eq!((found.x, found.y), (60, 30));
    assert_eq!(channel.captures(), 1);
}

#[tokio::test(start_paused = true)]
async fn find_times_out_with_image_not_found() {
    let channel = FakeChannel::showing(screen(160, 120, &[]));
    let mut session = session(&channel);

    let started = tokio::time::Instant::now();
    let err = session
        .find(vec!["alpha", "beta"], Some(Duration::from_secs(2)))
        .await
        .unwrap_err();

    match err {
        Error::ImageNotFound { target, .. } => assert_eq!(target, "[alpha, beta]"),
        other => panic!("unexpected error {other}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(2));
    // one capture at t=0 and one after each 250ms sleep
    assert_eq!(channel.captures(), 9);
}

#[tokio::test(start_paused = true)]
async fn wait_absorbs_screens_that_appear_late() {
    let channel = FakeChannel::new();
    channel.push_frame(screen(160, 120, &[]));
    channel.push_frame(screen(160, 120, &[]));
    channel.push_frame(beta_screen());
    let mut session = session(&channel);

    session.wait("beta", None).await.unwrap();
    assert_eq!(channel.captures(), 3);
}

#[tokio::test(start_paused = true)]
async fn failing_captures_surface_the_capture_error() {
    let channel = FakeChannel::showing(beta_screen());
    channel.fail_captures(true);
    let mut session = session(&channel);

    let err = session.find("beta", Some(Duration::from_secs(1))).await.unwrap_err();
    assert!(err.is_infrastructure());
}

#[tokio::test(start_paused = true)]
async fn unknown_image_name_is_a_usage_error() {
    let channel = FakeChannel::showing(beta_screen());
    let mut session = session(&channel);

    let err = session.wait("gamma", None).await.unwrap_err();
    assert!(matches!(err, Error::Usage(_)));
    assert_eq!(channel.captures(), 0);
}

#[tokio::test(start_paused = true)]
async fn click_by_name_uses_focus_point() {
    let channel = FakeChannel::showing(beta_screen());
    let mut session = session(&channel);

    session.click("beta").await.unwrap();
    assert_eq!(
        channel.actions(),
        vec![Action::Move(60 + 8 + 4, 30 + 8), Action::Press(Button::Left)]
    );
}

#[tokio::test(start_paused = true)]
async fn click_accepts_points_and_matches() {
    let channel = FakeChannel::showing(beta_screen());
    let mut session = session(&channel);

    session.right_click((5, 7)).await.unwrap();
    let found = session.find(Target::from("beta"), None).await.unwrap();
    session.hover(found.clone()).await.unwrap();
    session.double_click(found).await.unwrap();

    assert_eq!(
        channel.actions(),
        vec![
            Action::Move(5, 7),
            Action::Press(Button::Right),
            Action::Move(72, 38),
            Action::Move(72, 38),
            Action::Press(Button::Left),
            Action::Press(Button::Left),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn typing_text_keys_and_combinations() {
    let channel = FakeChannel::new();
    let mut session = session(&channel);

    session.type_text("ok").await.unwrap();
    session.type_text("<enter>").await.unwrap();
    session
        .type_input(&KeyInput::combo(&["<ctrl>", "<alt>", "<del>"]).unwrap())
        .await
        .unwrap();

    assert_eq!(
        channel.actions(),
        vec![
            Action::Keys(vec![KeyCode::Char('o')]),
            Action::Keys(vec![KeyCode::Char('k')]),
            Action::Keys(vec![KeyCode::Key(Key::Enter)]),
            Action::Keys(vec![
                KeyCode::Key(Key::Ctrl),
                KeyCode::Key(Key::Alt),
                KeyCode::Key(Key::Delete),
            ]),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn declared_focus_offset_shifts_the_click() {
    let dir = tempfile::tempdir().unwrap();
    pattern(16, 16, 3).save(dir.path().join("next.png")).unwrap();
    std::fs::write(
        dir.path().join("images.toml"),
        "[image.next]\nfilename = \"next.png\"\nsimilarity = 0.9\nfocus_delta = [10, -20]\n",
    )
    .unwrap();
    let catalog = ImageCatalog::load(dir.path()).unwrap();

    let channel = FakeChannel::showing(screen(160, 120, &[(&pattern(16, 16, 3), 40, 50)]));
    let mut session = Session::new(
        Box::new(channel.clone()),
        Box::new(NccMatcher::new()),
        catalog,
        settings(),
    );

    let found = session.find("next", None).await.unwrap();
    assert_eq!(found.focus_point(), (40 + 8 + 10, 50 + 8 - 20));
}

#[tokio::test(start_paused = true)]
async fn log_screen_and_recording() {
    let dir = tempfile::tempdir().unwrap();
    let channel = FakeChannel::showing(beta_screen());
    let mut session = session(&channel);

    let shot = dir.path().join("shot.png");
    session.log_screen(&shot).await.unwrap();
    assert!(shot.is_file());

    assert!(!session.set_recording(&dir.path().join("video.ogv")).await);
    assert!(!session.is_recording());
    session.finish().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn catalog_images_can_be_passed_by_value() {
    let channel = FakeChannel::showing(beta_screen());
    let mut session = session(&channel);

    let beta: Arc<ReferenceImage> = session.image("beta").unwrap();
    session.wait(beta, Some(Duration::from_secs(1))).await.unwrap();
}
