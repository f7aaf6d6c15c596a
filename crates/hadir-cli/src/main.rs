use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use hadir_core::{
    capture_enrollment, capture_probe, DescriptorExtractor, EnrollmentConfig, EnrollmentOutcome,
    LazyExtractor, ProbeConfig, ProbeOutcome, QualityGate, ReplayLoader,
};
use hadir_hw::{CaptureLease, DirectoryFrameSource, FrameSource, SourceError};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod client;

use client::{Client, Marked, Recognition};

#[derive(Parser)]
#[command(name = "hadir", about = "Face recognition attendance CLI")]
struct Cli {
    /// hadird base URL
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

/// Where frames and their face detections come from.
#[derive(Args)]
struct CaptureArgs {
    /// Directory of frames, replayed in file-name order
    #[arg(long)]
    frames: PathBuf,
    /// Recorded detections (JSON) keyed by frame sequence
    #[arg(long)]
    detections: PathBuf,
    /// Delay between capture attempts in milliseconds
    #[arg(long, default_value_t = 150)]
    interval_ms: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture samples and enroll a student's face
    Enroll {
        /// Student ID
        #[arg(short, long)]
        student: String,
        #[command(flatten)]
        capture: CaptureArgs,
        /// Samples to collect
        #[arg(long, default_value_t = 6)]
        samples: usize,
        /// Fewest samples accepted
        #[arg(long, default_value_t = 4)]
        min_samples: usize,
        /// Do not upload the reference photo
        #[arg(long)]
        no_photo: bool,
    },
    /// Recognize a face in a class and check them in
    Recognize {
        /// Class ID
        #[arg(short, long)]
        class: String,
        /// Only compare against this student
        #[arg(long)]
        student: Option<String>,
        #[command(flatten)]
        capture: CaptureArgs,
    },
    /// Record attendance manually
    Mark {
        #[arg(short, long)]
        student: String,
        #[arg(short, long)]
        class: String,
        /// PRESENT, ABSENT, SICK or PERMIT
        #[arg(long)]
        status: Option<String>,
    },
    /// Show a class's attendance for a day
    Roll {
        #[arg(short, long)]
        class: String,
        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        date: Option<String>,
    },
    /// Show daemon status
    Status,
    /// Run frame quality diagnostics without contacting the daemon
    Check {
        #[command(flatten)]
        capture: CaptureArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.server);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Enroll {
            student,
            capture,
            samples,
            min_samples,
            no_photo,
        } => {
            let extractor = load_extractor(&capture).await?;
            let mut source = DirectoryFrameSource::new(&capture.frames);
            let config = EnrollmentConfig {
                target_samples: samples,
                min_samples,
                interval: Duration::from_millis(capture.interval_ms),
                ..EnrollmentConfig::default()
            };

            println!("Enrolling {student}. Look at the camera and move your head slightly.");
            let outcome = capture_enrollment(
                &mut source,
                &extractor,
                &QualityGate::default(),
                config,
                &cancel,
                |event| println!("  [{:>2}] {}", event.attempt, event.outcome),
            )
            .await?;

            match outcome {
                EnrollmentOutcome::Succeeded(face) => {
                    let descriptors: Vec<Vec<f32>> =
                        face.samples.iter().map(|s| s.values.clone()).collect();
                    let photo = if no_photo {
                        None
                    } else {
                        face.snapshot.map(|s| s.to_data_url())
                    };
                    let enrolled = client
                        .enroll_face(&student, &descriptors, photo.as_deref())
                        .await?;
                    println!(
                        "Enrolled {} with {} samples in {} attempts",
                        enrolled.id, enrolled.sample_count, face.attempts
                    );
                    if let Some(url) = enrolled.face_image_url {
                        println!("  photo: {}", truncate(&url, 60));
                    }
                }
                EnrollmentOutcome::InsufficientSamples { collected, required } => {
                    bail!("only {collected} of {required} required samples captured; improve lighting and try again")
                }
                EnrollmentOutcome::NoMovement { collected } => {
                    bail!("no head movement across {collected} samples; move slightly during capture")
                }
                EnrollmentOutcome::Cancelled => println!("Enrollment cancelled"),
            }
        }
        Commands::Recognize {
            class,
            student,
            capture,
        } => {
            let extractor = load_extractor(&capture).await?;
            let mut source = DirectoryFrameSource::new(&capture.frames);
            let config = ProbeConfig {
                interval: Duration::from_millis(capture.interval_ms),
                ..ProbeConfig::default()
            };

            let probe = match capture_probe(&mut source, &extractor, &config, &cancel).await? {
                ProbeOutcome::Ready { probe, used } => {
                    tracing::debug!(used, "probe ready");
                    probe
                }
                ProbeOutcome::FaceNotDetected { usable, required } => {
                    bail!("face not detected ({usable} of {required} frames usable)")
                }
                ProbeOutcome::Cancelled => {
                    println!("Recognition cancelled");
                    return Ok(());
                }
            };

            match client.recognize(&class, student.as_deref(), &probe.values).await? {
                Recognition::Matched { student, distance } => {
                    println!(
                        "Recognized {} ({}, {}) distance {}",
                        student.full_name,
                        student.student_number,
                        student.class_name,
                        format_distance(distance)
                    );
                    match client.mark(&student.id, &class, Some("PRESENT")).await? {
                        Marked::Recorded(_) => println!("Checked in"),
                        Marked::AlreadyRecorded => println!("{} already checked in today", student.full_name),
                    }
                }
                Recognition::NoMatch { distance } => {
                    println!("Face not recognized (nearest distance {})", format_distance(distance));
                }
                Recognition::AlreadyRecorded { student } => match student {
                    Some(s) => println!("{} already checked in today", s.full_name),
                    None => println!("Already checked in today"),
                },
            }
        }
        Commands::Mark {
            student,
            class,
            status,
        } => match client.mark(&student, &class, status.as_deref()).await? {
            Marked::Recorded(record) => println!(
                "Recorded {} for {}",
                record["status"].as_str().unwrap_or("PRESENT"),
                student
            ),
            Marked::AlreadyRecorded => println!("{student} already has attendance today"),
        },
        Commands::Roll { class, date } => {
            let roll = client.roll(&class, date.as_deref()).await?;
            println!(
                "{} on {}",
                roll["class"]["name"].as_str().unwrap_or(&class),
                roll["date"].as_str().unwrap_or("-")
            );
            for s in roll["students"].as_array().into_iter().flatten() {
                println!(
                    "  {:<28} {:<12} {:<8} {:<5} {}",
                    s["fullName"].as_str().unwrap_or("?"),
                    s["studentNumber"].as_str().unwrap_or(""),
                    s["status"].as_str().unwrap_or("-"),
                    s["checkInTime"].as_str().unwrap_or(""),
                    if s["hasFace"].as_bool().unwrap_or(false) { "face" } else { "" }
                );
            }
        }
        Commands::Status => {
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Check { capture } => {
            let extractor = load_extractor(&capture).await?;
            let mut source = DirectoryFrameSource::new(&capture.frames);
            check_frames(&mut source, &extractor, &cancel).await?;
        }
    }

    Ok(())
}

async fn load_extractor(capture: &CaptureArgs) -> Result<LazyExtractor<ReplayLoader>> {
    let extractor = LazyExtractor::new(ReplayLoader {
        path: capture.detections.clone(),
    });
    extractor
        .ensure_loaded()
        .await
        .with_context(|| format!("failed to load detections from {}", capture.detections.display()))?;
    Ok(extractor)
}

/// Print quality metrics for every frame of the source.
async fn check_frames<S, E>(
    source: &mut S,
    extractor: &E,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: FrameSource + ?Sized,
    E: DescriptorExtractor + ?Sized,
{
    let gate = QualityGate::default();
    let mut lease = CaptureLease::acquire(source)?;
    let (mut passed, mut total) = (0usize, 0usize);

    while !cancel.is_cancelled() {
        let frame = match lease.next_frame() {
            Ok(frame) => frame,
            Err(SourceError::Exhausted) => break,
            Err(e) => return Err(e.into()),
        };
        total += 1;

        let extracted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = extractor.extract(&frame) => result?,
        };
        let Some(face) = extracted else {
            println!("  frame {:>3}: face not detected", frame.sequence);
            continue;
        };
        let report = gate.assess(&frame, &face)?;
        let m = &report.metrics;
        let verdict = match report.rejection {
            Some(r) => r.to_string(),
            None => {
                passed += 1;
                format!("ok (score {:.0})", report.score)
            }
        };
        println!(
            "  frame {:>3}: brightness {:>5.1}  blur {:>7.1}  roll {:>5.1}  face {:.2}x{:.2}  {}",
            frame.sequence,
            m.brightness,
            m.blur,
            m.roll_degrees,
            m.face_width_ratio,
            m.face_height_ratio,
            verdict
        );
    }

    println!("{passed}/{total} frames usable");
    Ok(())
}

fn format_distance(distance: Option<f32>) -> String {
    distance.map_or_else(|| "n/a".to_string(), |d| format!("{d:.3}"))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hadir_core::{ExtractorError, FaceDetection};
    use hadir_hw::Frame;

    #[test]
    fn test_parse_enroll() {
        let cli = Cli::try_parse_from([
            "hadir", "enroll", "-s", "s1", "--frames", "/tmp/f", "--detections", "/tmp/d.json",
        ])
        .unwrap();
        let Commands::Enroll { student, capture, samples, min_samples, no_photo } = cli.command else {
            panic!("expected enroll");
        };
        assert_eq!(student, "s1");
        assert_eq!((samples, min_samples, no_photo), (6, 4, false));
        assert_eq!(capture.interval_ms, 150);
        assert_eq!(cli.server, "http://127.0.0.1:8080");
    }

    #[test]
    fn test_parse_recognize_without_student() {
        let cli = Cli::try_parse_from([
            "hadir", "--server", "http://school:9000", "recognize", "-c", "7a", "--frames", "f",
            "--detections", "d.json",
        ])
        .unwrap();
        let Commands::Recognize { class, student, .. } = cli.command else {
            panic!("expected recognize");
        };
        assert_eq!(class, "7a");
        assert_eq!(student, None);
        assert_eq!(cli.server, "http://school:9000");
    }

    struct StalledExtractor;

    #[async_trait::async_trait]
    impl DescriptorExtractor for StalledExtractor {
        async fn extract(
            &self,
            _frame: &Frame,
        ) -> Result<Option<FaceDetection>, ExtractorError> {
            std::future::pending().await
        }
    }

    /// Endless copies of one small grey frame.
    struct RepeatingSource {
        next: u32,
    }

    impl FrameSource for RepeatingSource {
        fn open(&mut self) -> Result<(), SourceError> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Frame, SourceError> {
            self.next += 1;
            Ok(Frame::new(vec![128; 4 * 4 * 3], 4, 4, self.next).unwrap())
        }

        fn close(&mut self) {}

        fn name(&self) -> &str {
            "repeating"
        }
    }

    #[tokio::test]
    async fn test_check_frames_stops_on_cancel_while_extracting() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let mut source = RepeatingSource { next: 0 };
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            check_frames(&mut source, &StalledExtractor, &cancel),
        )
        .await
        .expect("check_frames ignored cancellation");
        assert!(result.is_ok());
        assert_eq!(source.next, 1);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
    }
}
