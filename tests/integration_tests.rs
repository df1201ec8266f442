use emotion_compiler::prelude::*;
use assert_cmd::Command;
use image::{Rgb, RgbImage};
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

/// Helper: a directory of numbered 32x18 PNG frames, frame `i` split red/blue at shade `i * 40`
fn create_frame_dir(count: u32) -> TempDir {
    let dir = tempdir().unwrap();
    for i in 0..count {
        let shade = (i * 40) as u8;
        RgbImage::from_fn(32, 18, |x, _| if x < 16 { Rgb([shade, 0, 0]) } else { Rgb([0, 0, shade]) })
            .save(dir.path().join(format!("frame_{:04}.png", i + 1)))
            .unwrap();
    }
    dir
}

fn write_json(dir: &Path, name: &str, json: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, json).unwrap();
    path
}

fn compiler() -> Command {
    Command::cargo_bin("emotion-compiler").unwrap()
}

#[test]
fn test_cli_help() {
    compiler()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("compile"))
        .stdout(predicate::str::contains("inspect"));
}

#[test]
fn test_cli_version() {
    compiler()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_cli_missing_source() {
    let work = tempdir().unwrap();
    let timeline = write_json(work.path(), "t.json", r#"{"loopTimeline": []}"#);

    compiler()
        .args(["compile", "nonexistent.mp4", "-t"])
        .arg(&timeline)
        .arg("-o")
        .arg(work.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_cli_invalid_quality() {
    let frames = create_frame_dir(2);
    let work = tempdir().unwrap();
    let timeline = write_json(work.path(), "t.json", r#"{"loopTimeline": []}"#);

    compiler()
        .arg("compile")
        .arg(frames.path())
        .arg("-t")
        .arg(&timeline)
        .arg("-o")
        .arg(work.path())
        .args(["--quality", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Quality must be between 1 and 100"));
}

#[test]
fn test_compile_loop_only_timeline() {
    let frames = create_frame_dir(5);
    let work = tempdir().unwrap();
    let timeline = write_json(
        work.path(),
        "happy.json",
        r#"{"loopTimeline": [{"sourceFrameIndex": 0, "actions": [{"type": "overlay", "effect": "sparkle"}]}, {"sourceFrameIndex": 1}]}"#,
    );
    let out = work.path().join("out");

    compiler()
        .arg("compile")
        .arg(frames.path())
        .arg("-t")
        .arg(&timeline)
        .arg("-o")
        .arg(&out)
        .args(["--canvas", "24x28"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Frames: 2"));

    let anim = std::fs::read(out.join("happy.anim")).unwrap();
    let header = inspect_header(&anim).unwrap();
    assert_eq!(header.frame_count, 2);
    assert_eq!((header.width, header.height), (24, 28));

    let mjpeg = std::fs::read(out.join("happy.mjpeg")).unwrap();
    assert_eq!(split_frames(&mjpeg).unwrap().len(), 2);

    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("happy.manifest.json")).unwrap()).unwrap();
    assert_eq!(manifest["totalFrames"], 2);
    assert!((manifest["durationSeconds"].as_f64().unwrap() - 0.2).abs() < 1e-9);
    assert_eq!(manifest["frames"][0]["actions"][0]["effect"], "sparkle");
    assert!(manifest.get("budgetWarning").is_none());
}

#[test]
fn test_compile_then_inspect_and_dump() {
    let frames = create_frame_dir(3);
    let work = tempdir().unwrap();
    let timeline = write_json(
        work.path(),
        "wave.json",
        r#"{"introTimeline": [{"sourceFrameIndex": 2}], "loopTimeline": [{"sourceFrameIndex": 1}], "exitTimeline": [{"sourceFrameIndex": 0}]}"#,
    );
    let out = work.path().join("out");

    compiler()
        .arg("compile")
        .arg(frames.path())
        .arg("-t")
        .arg(&timeline)
        .arg("-o")
        .arg(&out)
        .args(["--canvas", "32x32", "--format", "anim", "--id", "wave"])
        .assert()
        .success();
    assert!(!out.join("wave.mjpeg").exists());

    let dump = work.path().join("dump");
    compiler()
        .arg("inspect")
        .arg(out.join("wave.anim"))
        .arg("--dump-dir")
        .arg(&dump)
        .assert()
        .success()
        .stdout(predicate::str::contains("Frames: 3"))
        .stdout(predicate::str::contains("Dimensions: 32x32"));

    for i in 0..3 {
        let frame = image::open(dump.join(format!("frame_{:04}.png", i))).unwrap().to_rgb8();
        assert_eq!(frame.dimensions(), (32, 32));
    }
    // letterbox bands stay black
    let first = image::open(dump.join("frame_0000.png")).unwrap().to_rgb8();
    assert_eq!(*first.get_pixel(16, 0), Rgb([0, 0, 0]));
}

#[test]
fn test_out_of_range_index_fails_compile() {
    let frames = create_frame_dir(2);
    let work = tempdir().unwrap();
    let timeline = write_json(work.path(), "bad.json", r#"{"loopTimeline": [{"sourceFrameIndex": 9}]}"#);
    let out = work.path().join("out");

    compiler()
        .arg("compile")
        .arg(frames.path())
        .arg("-t")
        .arg(&timeline)
        .arg("-o")
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("source frame 9"));
    assert!(!out.join("bad.anim").exists());
}

#[test]
fn test_budget_overrun_still_compiles() {
    let frames = create_frame_dir(1);
    let work = tempdir().unwrap();
    let entries = vec![r#"{"sourceFrameIndex": 0}"#; 61].join(",");
    let timeline = write_json(work.path(), "long.json", &format!(r#"{{"loopTimeline": [{}]}}"#, entries));
    let out = work.path().join("out");

    compiler()
        .arg("compile")
        .arg(frames.path())
        .arg("-t")
        .arg(&timeline)
        .arg("-o")
        .arg(&out)
        .args(["--canvas", "8x8", "--format", "anim"])
        .assert()
        .success();

    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("long.manifest.json")).unwrap()).unwrap();
    assert_eq!(manifest["budgetWarning"]["totalFrames"], 61);
    assert_eq!(manifest["budgetWarning"]["budget"], 60);
}

#[test]
fn test_regions_command_writes_overlays() {
    let frames = create_frame_dir(2);
    let work = tempdir().unwrap();
    let regions = write_json(
        work.path(),
        "regions.json",
        r#"[{"frameIndex": 1, "key": "left-eye", "x": 0.1, "y": 0.2, "w": 0.3, "h": 0.4, "corner": "rounded", "expand": true},
            {"frameIndex": 0, "key": "mouth", "x": 0.4, "y": 0.6, "w": 0.2, "h": 0.2}]"#,
    );
    let out = work.path().join("regions");

    compiler()
        .arg("regions")
        .arg(frames.path())
        .arg("-r")
        .arg(&regions)
        .arg("-o")
        .arg(&out)
        .args(["--canvas", "32x32"])
        .assert()
        .success()
        .stdout(predicate::str::contains("left-eye (frame 1)"));

    let overlay = image::open(out.join("mouth_0.png")).unwrap().to_rgba8();
    assert_eq!(overlay.dimensions(), (32, 32));
    assert_eq!(overlay.get_pixel(0, 0)[3], 0);
    assert!(overlay.pixels().any(|p| p[3] == 255));
}

#[test]
fn test_probe_frame_directory() {
    let frames = create_frame_dir(4);
    compiler()
        .arg("probe")
        .arg(frames.path())
        .args(["--sequence-fps", "8"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Dimensions: 32x18"))
        .stdout(predicate::str::contains("Frames: 4"));
}

#[test]
fn test_inspect_rejects_garbage() {
    let work = tempdir().unwrap();
    let path = work.path().join("junk.anim");
    std::fs::write(&path, b"RIFF0000000000000000").unwrap();

    compiler()
        .arg("inspect")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Bad magic"));
}

mod unit_tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "0:00.000");
        assert_eq!(format_duration(0.2), "0:00.200");
        assert_eq!(format_duration(90.5), "1:30.500");
    }

    #[test]
    fn test_parse_canvas() {
        assert_eq!(parse_canvas("240x280").unwrap(), Canvas::default());
        assert!(parse_canvas("240").is_err());
        assert!(parse_canvas("0x10").is_err());
    }
}

mod property_tests {
    use super::*;

    fn stripes(width: u32, height: u32, colors: &[Rgb<u8>]) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| colors[((x + y) as usize) % colors.len()])
    }

    #[test]
    fn test_fitted_content_stays_inside_canvas() {
        let canvas = Canvas::default();
        for (w, h) in [(1280, 720), (720, 1280), (240, 280), (1, 1000), (1000, 1)] {
            let t = FitTransform::new(w, h, canvas);
            let r = t.map_rect(NormRect::FULL);
            assert!(r.x >= -1e-12 && r.y >= -1e-12);
            assert!(r.x + r.w <= 1.0 + 1e-12 && r.y + r.h <= 1.0 + 1e-12);
            assert!((r.w - 1.0).abs() < 1e-12 || (r.h - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_codec_round_trip_on_rgb565_colors() {
        let canvas = Canvas::new(20, 14).unwrap();
        let palette: Vec<Rgb<u8>> = [0xf800u16, 0x07e0, 0x001f, 0xffff, 0x0000]
            .iter()
            .map(|&v| Rgb565(v).to_rgb())
            .collect();
        let frames = vec![stripes(20, 14, &palette), stripes(20, 14, &palette[1..3])];

        let bytes = encode_animation(&frames, canvas).unwrap();
        let decoded = decode_animation(&bytes).unwrap();
        assert_eq!(decoded.frames, frames);
        assert_eq!(bytes, encode_animation(&frames, canvas).unwrap());
    }

    #[test]
    fn test_duration_matches_frame_count() {
        let timeline = Timeline {
            intro_timeline: vec![TimelineFrame::new(0); 3],
            loop_timeline: vec![TimelineFrame::new(1); 4],
            exit_timeline: vec![TimelineFrame::new(2); 5],
        };
        assert_eq!(timeline.total_frames(), 12);
        assert!((timeline.duration(12.0).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rounded_region_never_exceeds_square() {
        let frame = RgbImage::from_pixel(40, 40, Rgb([9, 9, 9]));
        let rect = NormRect::new(0.1, 0.2, 0.6, 0.5);
        let square = extract_transparent(&frame, rect, CornerStyle::Square);
        let rounded = extract_transparent(&frame, rect, CornerStyle::Rounded);
        for (s, r) in square.pixels().zip(rounded.pixels()) {
            assert!(r[3] <= s[3]);
        }
    }
}
