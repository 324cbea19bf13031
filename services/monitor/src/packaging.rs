//! Turns an event and its frame bundle into an email.

use crate::debounce::Event;
use crate::frame_buffer::FrameBundle;
use crate::sensor::Reading;
use crate::transport::{Attachment, OutgoingEmail};
use bytes::Bytes;
use std::fmt::Write as _;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Errors that can occur while packaging an alert.
#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("Failed to build archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Failed to write archive: {0}")]
    Io(#[from] std::io::Error),
}

/// Alert ready for delivery, plus the archive written to disk for it.
#[derive(Debug, Clone)]
pub struct PackagedAlert {
    pub email: OutgoingEmail,
    pub archive_path: Option<PathBuf>,
}

/// Renders subjects and bodies and builds frame archives.
#[derive(Debug, Clone)]
pub struct AlertPackager {
    location: String,
    include_images: bool,
    archives_dir: Option<PathBuf>,
}

impl AlertPackager {
    pub fn new(
        location: impl Into<String>,
        include_images: bool,
        archives_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            location: location.into(),
            include_images,
            archives_dir,
        }
    }

    /// Package an event for the given recipients.
    ///
    /// The archive is only built when images are enabled and the bundle has
    /// frames.
    pub async fn package(
        &self,
        event: &Event,
        bundle: &FrameBundle,
        recipients: &[String],
    ) -> Result<PackagedAlert, PackagingError> {
        let mut attachment = None;
        let mut archive_path = None;

        if self.include_images && !bundle.is_empty() {
            let filename = archive_name(event);
            let data = Bytes::from(build_archive(bundle)?);

            if let Some(dir) = &self.archives_dir {
                tokio::fs::create_dir_all(dir).await?;
                let path = dir.join(&filename);
                tokio::fs::write(&path, &data).await?;
                archive_path = Some(path);
            }

            debug!(
                sequence = event.sequence,
                frames = bundle.len(),
                bytes = data.len(),
                "Alert archive built"
            );

            attachment = Some(Attachment {
                filename,
                content_type: "application/zip".to_string(),
                data,
            });
        }

        Ok(PackagedAlert {
            email: OutgoingEmail {
                attachment,
                ..self.text_only(event, bundle, recipients)
            },
            archive_path,
        })
    }

    /// Same message without an attachment, used when the archive cannot be
    /// built.
    pub fn text_only(
        &self,
        event: &Event,
        bundle: &FrameBundle,
        recipients: &[String],
    ) -> OutgoingEmail {
        OutgoingEmail {
            subject: render_subject(event),
            body: render_body(event, bundle, &self.location),
            attachment: None,
            recipients: recipients.to_vec(),
        }
    }
}

/// Subject line, e.g. `[CRITICAL] RoomGuard alert - FLAME (flame-1)`.
pub fn render_subject(event: &Event) -> String {
    format!(
        "[{}] RoomGuard alert - {} ({})",
        event.kind.severity().label(),
        event.kind.as_str().to_uppercase(),
        event.channel_id
    )
}

pub fn render_body(event: &Event, bundle: &FrameBundle, location: &str) -> String {
    let mut body = String::new();
    let reading = match event.reading {
        Reading::Analog(v) => format!("{:.1}{}", v, event.kind.unit()),
        digital => digital.to_string(),
    };

    // Writing into a String cannot fail
    let _ = writeln!(body, "RoomGuard detected a hazardous condition.");
    let _ = writeln!(body);
    let _ = writeln!(body, "Kind:      {}", event.kind);
    let _ = writeln!(body, "Severity:  {}", event.kind.severity().label());
    let _ = writeln!(body, "Channel:   {}", event.channel_id);
    let _ = writeln!(body, "Confirmed: {}", event.confirmed_at.to_rfc3339());
    let _ = writeln!(body, "Sequence:  {}", event.sequence);
    let _ = writeln!(body, "Reading:   {}", reading);
    let _ = writeln!(body, "Location:  {}", location);
    let _ = writeln!(body);

    match bundle.time_span() {
        Some((first, last)) => {
            let _ = writeln!(
                body,
                "Attached {} frame(s) captured between {} and {}.",
                bundle.len(),
                first.to_rfc3339(),
                last.to_rfc3339()
            );
        }
        None => {
            let _ = writeln!(body, "No camera frames were available.");
        }
    }

    body
}

/// Archive file name, sortable by confirmation time.
pub fn archive_name(event: &Event) -> String {
    format!(
        "alert_{}_{:08}.zip",
        event.confirmed_at.format("%Y%m%dT%H%M%SZ"),
        event.sequence
    )
}

/// Build a ZIP of the bundle's frames, oldest first.
pub fn build_archive(bundle: &FrameBundle) -> Result<Vec<u8>, PackagingError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(bundle.total_bytes() + 1024)));
    // JPEG is already compressed
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    for (i, frame) in bundle.frames().iter().enumerate() {
        let name = format!(
            "frame_{:03}_{}.jpg",
            i + 1,
            frame.captured_at.format("%Y%m%dT%H%M%S%.3fZ")
        );
        writer.start_file(name, options)?;
        writer.write_all(&frame.data)?;
    }

    Ok(writer.finish()?.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_buffer::{Frame, FrameRingBuffer};
    use crate::sensor::SensorKind;
    use chrono::{DateTime, Duration, Utc};

    fn event(kind: SensorKind, reading: Reading) -> Event {
        Event {
            sequence: 7,
            channel_id: format!("{}-1", kind),
            kind,
            confirmed_at: DateTime::parse_from_rfc3339("2024-03-01T12:30:45Z")
                .unwrap()
                .with_timezone(&Utc),
            reading,
        }
    }

    fn bundle(n: u64) -> FrameBundle {
        let start = Utc::now();
        let mut buffer = FrameRingBuffer::new(10);
        for i in 1..=n {
            buffer.push(Frame::new(
                i,
                start + Duration::seconds(i as i64 * 5),
                vec![0xFF, 0xD8, i as u8],
            ));
        }
        buffer.snapshot()
    }

    #[test]
    fn test_subject_includes_severity() {
        let subject = render_subject(&event(SensorKind::Flame, Reading::Digital(true)));
        assert_eq!(subject, "[CRITICAL] RoomGuard alert - FLAME (flame-1)");

        let subject = render_subject(&event(SensorKind::Humidity, Reading::Analog(85.0)));
        assert!(subject.starts_with("[WARNING]"));
    }

    #[test]
    fn test_body_mentions_event_details() {
        let body = render_body(
            &event(SensorKind::Temperature, Reading::Analog(41.25)),
            &bundle(3),
            "Server Room B",
        );
        assert!(body.contains("Kind:      temperature"));
        assert!(body.contains("Confirmed: 2024-03-01T12:30:45+00:00"));
        assert!(body.contains("Reading:   41.2°C") || body.contains("Reading:   41.3°C"));
        assert!(body.contains("Location:  Server Room B"));
        assert!(body.contains("Attached 3 frame(s)"));
    }

    #[test]
    fn test_body_without_frames() {
        let body = render_body(
            &event(SensorKind::Water, Reading::Digital(true)),
            &FrameBundle::empty(),
            "Machine Room",
        );
        assert!(body.contains("No camera frames were available."));
    }

    #[test]
    fn test_archive_contains_frames_in_order() {
        let data = build_archive(&bundle(3)).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(data)).unwrap();
        assert_eq!(archive.len(), 3);

        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names[0].starts_with("frame_001_"));
        assert!(names[2].starts_with("frame_003_"));
        assert!(names.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_archive_name() {
        let name = archive_name(&event(SensorKind::Smoke, Reading::Digital(true)));
        assert_eq!(name, "alert_20240301T123045Z_00000007.zip");
    }

    #[tokio::test]
    async fn test_package_writes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let packager = AlertPackager::new("Machine Room", true, Some(dir.path().join("alerts")));
        let recipients = vec!["ops@example.org".to_string()];

        let packaged = packager
            .package(&event(SensorKind::Flame, Reading::Digital(true)), &bundle(2), &recipients)
            .await
            .unwrap();

        let path = packaged.archive_path.unwrap();
        assert!(path.exists());
        let attachment = packaged.email.attachment.unwrap();
        assert_eq!(attachment.filename, "alert_20240301T123045Z_00000007.zip");
        assert_eq!(std::fs::read(&path).unwrap(), attachment.data.to_vec());
        assert_eq!(packaged.email.recipients, recipients);
    }

    #[tokio::test]
    async fn test_package_without_images() {
        let packager = AlertPackager::new("Machine Room", false, None);
        let packaged = packager
            .package(&event(SensorKind::Flame, Reading::Digital(true)), &bundle(2), &[])
            .await
            .unwrap();
        assert!(packaged.email.attachment.is_none());
        assert!(packaged.archive_path.is_none());
    }
}
