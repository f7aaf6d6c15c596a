//! Attendance operations behind the HTTP API.
//!
//! Requests are independent and hold no in-process locks. The only ordering
//! guarantee is the store's one-record-per-student-per-day constraint.

use crate::photo::{decode_data_url, PhotoError, PhotoStore};
use crate::store::{
    AttendanceRecord, AttendanceStatus, ClassRecord, InsertOutcome, Store, StoreCounts, StoreError,
    Student,
};
use chrono::{Local, NaiveDate};
use hadir_core::{Candidate, Embedding, EuclideanMatcher, FaceTemplate, Matcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("attendance already recorded today")]
    AlreadyRecorded { matched: Option<MatchedStudent> },
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PhotoError> for ServiceError {
    fn from(e: PhotoError) -> Self {
        match e {
            PhotoError::InvalidFormat => ServiceError::Validation("invalid face photo format".into()),
            PhotoError::TooLarge { limit, .. } => ServiceError::PayloadTooLarge(format!(
                "face photo exceeds {:.1} MB",
                limit as f64 / (1024.0 * 1024.0)
            )),
            PhotoError::Io(e) => ServiceError::Io(e),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollRequest {
    #[serde(default)]
    pub descriptors: Value,
    #[serde(default)]
    pub face_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollResponse {
    pub id: String,
    pub face_image_url: Option<String>,
    pub sample_count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizeRequest {
    #[serde(default)]
    pub class_id: String,
    /// Restricts matching to one student of the class.
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub descriptor: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedStudent {
    pub id: String,
    pub full_name: String,
    pub student_number: String,
    pub gender: String,
    pub class_name: String,
}

impl From<&Student> for MatchedStudent {
    fn from(s: &Student) -> Self {
        Self {
            id: s.id.clone(),
            full_name: s.full_name.clone(),
            student_number: s.student_number.clone(),
            gender: s.gender.clone(),
            class_name: s.class_name.clone().unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizeResponse {
    #[serde(rename = "match")]
    pub matched: Option<MatchedStudent>,
    pub distance: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRequest {
    #[serde(default)]
    pub student_id: String,
    #[serde(default)]
    pub class_id: String,
    /// Defaults to PRESENT.
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollEntry {
    pub id: String,
    pub full_name: String,
    pub student_number: String,
    pub gender: String,
    pub face_image_url: Option<String>,
    pub has_face: bool,
    pub status: Option<AttendanceStatus>,
    /// Local `HH:MM`.
    pub check_in_time: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayRoll {
    pub class: ClassRecord,
    pub date: NaiveDate,
    pub students: Vec<RollEntry>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub version: &'static str,
    pub match_threshold: f32,
    #[serde(flatten)]
    pub counts: StoreCounts,
}

/// Clone-safe handle shared by all request handlers.
#[derive(Clone)]
pub struct AttendanceService {
    store: Store,
    photos: PhotoStore,
    matcher: EuclideanMatcher,
    max_samples: usize,
    max_image_bytes: usize,
}

impl AttendanceService {
    pub fn new(
        store: Store,
        photos: PhotoStore,
        match_threshold: f32,
        max_samples: usize,
        max_image_bytes: usize,
    ) -> Self {
        Self {
            store,
            photos,
            matcher: EuclideanMatcher {
                threshold: match_threshold,
            },
            max_samples,
            max_image_bytes,
        }
    }

    pub fn photos(&self) -> &PhotoStore {
        &self.photos
    }

    /// Replace a student's face template and, optionally, reference photo.
    ///
    /// Every input is validated before anything is written.
    pub async fn enroll_face(
        &self,
        student_id: &str,
        request: EnrollRequest,
    ) -> Result<EnrollResponse, ServiceError> {
        if student_id.trim().is_empty() {
            return Err(ServiceError::Validation("invalid student id".into()));
        }

        let samples = normalize_samples(&request.descriptors, self.max_samples)?;
        let template = FaceTemplate::aggregate(&samples)
            .map_err(|e| ServiceError::Validation(format!("invalid face data: {e}")))?;

        let photo = match request.face_image.as_deref() {
            None => None,
            Some(raw) if raw.trim().is_empty() => {
                return Err(ServiceError::Validation("invalid face photo format".into()));
            }
            Some(raw) => Some((decode_data_url(raw, self.max_image_bytes)?, raw)),
        };

        if self.store.find_student(student_id).await?.is_none() {
            return Err(ServiceError::NotFound("student not found".into()));
        }

        let photo_url = match photo {
            Some((image, raw)) => Some(self.photos.save(&image, raw).await?),
            None => None,
        };

        let face_image_url = self
            .store
            .save_face(student_id, &template, photo_url)
            .await?
            .ok_or_else(|| ServiceError::NotFound("student not found".into()))?;

        tracing::info!(student = student_id, samples = samples.len(), "face enrolled");
        Ok(EnrollResponse {
            id: student_id.to_string(),
            face_image_url,
            sample_count: samples.len(),
        })
    }

    /// Match a probe descriptor against a class roster, or against one
    /// student of it when `student_id` is given.
    ///
    /// Does not write attendance. A match, or a targeted student, already
    /// recorded today is reported as [`ServiceError::AlreadyRecorded`].
    pub async fn recognize(&self, request: RecognizeRequest) -> Result<RecognizeResponse, ServiceError> {
        let class_id = request.class_id.trim();
        if class_id.is_empty() {
            return Err(ServiceError::Validation("class is required".into()));
        }
        let probe = numeric_vector(&request.descriptor)
            .map(Embedding::new)
            .ok_or_else(|| ServiceError::Validation("invalid face data".into()))?;

        if self.store.find_class(class_id).await?.is_none() {
            return Err(ServiceError::NotFound("class not found".into()));
        }

        let scope = match request.student_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => {
                let student = self
                    .store
                    .find_student(id)
                    .await?
                    .ok_or_else(|| ServiceError::NotFound("student not found".into()))?;
                if student.class_id != class_id {
                    return Err(ServiceError::NotFound("student is not in this class".into()));
                }
                if self.store.find_attendance(&student.id, today()).await?.is_some() {
                    tracing::info!(student = %student.id, "target student already recorded today");
                    return Err(ServiceError::AlreadyRecorded {
                        matched: Some(MatchedStudent::from(&student)),
                    });
                }
                vec![student]
            }
            _ => self.store.class_roster(class_id).await?,
        };

        let candidates: Vec<Candidate> = scope
            .iter()
            .filter_map(|s| {
                s.template.clone().map(|template| Candidate {
                    id: s.id.clone(),
                    template,
                })
            })
            .collect();
        if candidates.is_empty() {
            return Err(ServiceError::NotFound("no enrolled faces to compare against".into()));
        }

        let result = self.matcher.best_match(&probe, &candidates);
        let matched = result
            .candidate_id
            .as_deref()
            .and_then(|id| scope.iter().find(|s| s.id == id));

        let Some(student) = matched else {
            tracing::info!(class = class_id, distance = ?result.distance, "no match");
            return Ok(RecognizeResponse {
                matched: None,
                distance: result.distance,
            });
        };

        let matched = MatchedStudent::from(student);
        if self.store.find_attendance(&student.id, today()).await?.is_some() {
            tracing::info!(student = %student.id, "recognized student already recorded today");
            return Err(ServiceError::AlreadyRecorded {
                matched: Some(matched),
            });
        }

        tracing::info!(student = %student.id, distance = ?result.distance, "recognized");
        Ok(RecognizeResponse {
            matched: Some(matched),
            distance: result.distance,
        })
    }

    /// Record today's attendance for a student.
    pub async fn mark(&self, request: MarkRequest) -> Result<AttendanceRecord, ServiceError> {
        let student_id = request.student_id.trim();
        let class_id = request.class_id.trim();
        if student_id.is_empty() {
            return Err(ServiceError::Validation("invalid student".into()));
        }
        if class_id.is_empty() {
            return Err(ServiceError::Validation("class is required".into()));
        }
        let status = match request.status.as_deref() {
            None => AttendanceStatus::Present,
            Some(s) => s
                .parse::<AttendanceStatus>()
                .map_err(|e| ServiceError::Validation(e.to_string()))?,
        };

        let student = self
            .store
            .find_student(student_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("student not found".into()))?;
        if student.class_id != class_id {
            return Err(ServiceError::NotFound("student is not in this class".into()));
        }
        if self.store.find_class(class_id).await?.is_none() {
            return Err(ServiceError::NotFound("class not found".into()));
        }

        let now = Local::now();
        let date = now.date_naive();
        if self.store.find_attendance(student_id, date).await?.is_some() {
            return Err(ServiceError::AlreadyRecorded { matched: None });
        }

        let record = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            student_id: student_id.to_string(),
            class_id: class_id.to_string(),
            date,
            status,
            check_in_time: now,
        };
        match self.store.insert_attendance(record).await? {
            InsertOutcome::Created(record) => {
                tracing::info!(student = student_id, %status, "attendance recorded");
                Ok(record)
            }
            InsertOutcome::Duplicate => {
                tracing::debug!(student = student_id, "lost attendance insert race");
                Err(ServiceError::AlreadyRecorded { matched: None })
            }
        }
    }

    /// Every student of a class with their attendance on `date`.
    pub async fn day_roll(&self, class_id: &str, date: Option<NaiveDate>) -> Result<DayRoll, ServiceError> {
        if class_id.trim().is_empty() {
            return Err(ServiceError::Validation("class is required".into()));
        }
        let date = date.unwrap_or_else(today);
        let class = self
            .store
            .find_class(class_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("class not found".into()))?;

        let roster = self.store.class_roster(class_id).await?;
        let attendance = self.store.class_attendance(class_id, date).await?;

        let students = roster
            .into_iter()
            .map(|s| {
                let record = attendance.iter().find(|a| a.student_id == s.id);
                RollEntry {
                    has_face: s.template.is_some(),
                    status: record.map(|r| r.status),
                    check_in_time: record.map(|r| r.check_in_time.format("%H:%M").to_string()),
                    id: s.id,
                    full_name: s.full_name,
                    student_number: s.student_number,
                    gender: s.gender,
                    face_image_url: s.face_image_url,
                }
            })
            .collect();

        Ok(DayRoll {
            class,
            date,
            students,
        })
    }

    pub async fn status(&self) -> Result<ServiceStatus, ServiceError> {
        Ok(ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            match_threshold: self.matcher.threshold,
            counts: self.store.counts().await?,
        })
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// A non-empty array of JSON numbers.
fn numeric_vector(value: &Value) -> Option<Vec<f32>> {
    let items = value.as_array()?;
    if items.is_empty() {
        return None;
    }
    items
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32).filter(|f| f.is_finite()))
        .collect()
}

/// Validate enrollment samples, keeping at most `max_samples`.
fn normalize_samples(value: &Value, max_samples: usize) -> Result<Vec<Embedding>, ServiceError> {
    let items = value
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| ServiceError::Validation("descriptors must be a non-empty array".into()))?;

    if items.len() > max_samples {
        tracing::debug!(received = items.len(), kept = max_samples, "dropping extra enrollment samples");
    }

    let mut samples: Vec<Embedding> = Vec::with_capacity(items.len().min(max_samples));
    for (index, item) in items.iter().take(max_samples).enumerate() {
        let values = numeric_vector(item).ok_or_else(|| {
            ServiceError::Validation(format!("sample {index} must be a non-empty array of numbers"))
        })?;
        if let Some(first) = samples.first() {
            if values.len() != first.len() {
                return Err(ServiceError::Validation(format!(
                    "sample {index} has {} values, expected {}",
                    values.len(),
                    first.len()
                )));
            }
        }
        samples.push(Embedding::new(values));
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::seeded_store;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    async fn service(inline: bool) -> (AttendanceService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoStore::new(dir.path().join("uploads"), inline);
        let svc = AttendanceService::new(seeded_store().await, photos, 0.55, 15, 64);
        (svc, dir)
    }

    fn base(seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..128).map(|_| rng.gen_range(-0.15..0.15)).collect()
    }

    fn noisy(base: &[f32], rng: &mut StdRng) -> Vec<f32> {
        base.iter().map(|v| v + rng.gen_range(-0.02..0.02)).collect()
    }

    fn enroll_body(samples: &[Vec<f32>], face_image: Option<String>) -> EnrollRequest {
        EnrollRequest {
            descriptors: json!(samples),
            face_image,
        }
    }

    fn recognize_body(class_id: &str, student_id: Option<&str>, probe: &[f32]) -> RecognizeRequest {
        RecognizeRequest {
            class_id: class_id.into(),
            student_id: student_id.map(Into::into),
            descriptor: json!(probe),
        }
    }

    fn mark_body(student_id: &str, class_id: &str, status: Option<&str>) -> MarkRequest {
        MarkRequest {
            student_id: student_id.into(),
            class_id: class_id.into(),
            status: status.map(Into::into),
        }
    }

    #[tokio::test]
    async fn test_enroll_then_recognize() {
        let (svc, _dir) = service(false).await;
        let v = base(1);
        let other = base(2);
        let mut rng = StdRng::seed_from_u64(3);

        let samples: Vec<Vec<f32>> = (0..6).map(|_| noisy(&v, &mut rng)).collect();
        let resp = svc.enroll_face("s1", enroll_body(&samples, None)).await.unwrap();
        assert_eq!(resp.sample_count, 6);
        assert_eq!(resp.face_image_url, None);

        let other_samples: Vec<Vec<f32>> = (0..6).map(|_| noisy(&other, &mut rng)).collect();
        svc.enroll_face("s2", enroll_body(&other_samples, None)).await.unwrap();

        let probes: Vec<Embedding> = (0..3).map(|_| Embedding::new(noisy(&v, &mut rng))).collect();
        let probe = hadir_core::average_descriptors(&probes).unwrap();

        let result = svc.recognize(recognize_body("7a", None, &probe.values)).await.unwrap();
        let matched = result.matched.unwrap();
        assert_eq!(matched.id, "s1");
        assert_eq!(matched.class_name, "VII A");
        assert!(result.distance.unwrap() <= 0.55);
    }

    #[tokio::test]
    async fn test_stored_mean_is_average_of_stored_samples() {
        let (svc, _dir) = service(false).await;
        let samples = vec![vec![0.0, 1.0, 2.0], vec![2.0, 3.0, 4.0], vec![1.0, 2.0, 6.0]];
        svc.enroll_face("s1", enroll_body(&samples, None)).await.unwrap();

        let student = svc.store.find_student("s1").await.unwrap().unwrap();
        let Some(FaceTemplate::Aggregated { mean, samples: stored }) = student.template else {
            panic!("expected aggregated template");
        };
        assert_eq!(stored, samples);
        let stored: Vec<Embedding> = stored.into_iter().map(Embedding::new).collect();
        let recomputed = Embedding::mean(&stored).unwrap();
        for (a, b) in mean.iter().zip(&recomputed.values) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(mean, vec![1.0, 2.0, 4.0]);
    }

    #[tokio::test]
    async fn test_targeted_recognize_conflicts_when_recorded_even_without_match() {
        let (svc, _dir) = service(false).await;
        svc.enroll_face("s1", enroll_body(&[vec![0.0, 0.0]], None)).await.unwrap();
        svc.mark(mark_body("s1", "7a", None)).await.unwrap();
        svc.mark(mark_body("s2", "7a", Some("SICK"))).await.unwrap();

        let far = svc.recognize(recognize_body("7a", Some("s1"), &[3.0, 4.0])).await;
        let Err(ServiceError::AlreadyRecorded { matched: Some(student) }) = far else {
            panic!("expected conflict, got {far:?}");
        };
        assert_eq!(student.id, "s1");

        // s2 has no face enrolled; the record still wins over "nothing to compare".
        let unenrolled = svc.recognize(recognize_body("7a", Some("s2"), &[3.0, 4.0])).await;
        assert!(matches!(
            unenrolled,
            Err(ServiceError::AlreadyRecorded { matched: Some(ref s) }) if s.id == "s2"
        ));
    }

    #[tokio::test]
    async fn test_recognize_rejects_non_finite_descriptor() {
        let (svc, _dir) = service(false).await;
        svc.enroll_face("s1", enroll_body(&[vec![0.0, 0.0]], None)).await.unwrap();

        let overflow = RecognizeRequest {
            class_id: "7a".into(),
            student_id: None,
            descriptor: json!([1e39, 0.0]),
        };
        assert!(matches!(svc.recognize(overflow).await, Err(ServiceError::Validation(_))));

        let enroll = EnrollRequest {
            descriptors: json!([[1e39, 0.0]]),
            face_image: None,
        };
        assert!(matches!(svc.enroll_face("s1", enroll).await, Err(ServiceError::Validation(_))));
    }

    #[tokio::test]
    async fn test_second_mark_same_day_conflicts() {
        let (svc, _dir) = service(false).await;
        let record = svc.mark(mark_body("s1", "7a", None)).await.unwrap();
        assert_eq!(record.status, AttendanceStatus::Present);
        assert_eq!(record.date, today());

        let again = svc.mark(mark_body("s1", "7a", Some("SICK"))).await;
        assert!(matches!(again, Err(ServiceError::AlreadyRecorded { matched: None })));
        assert_eq!(svc.store.class_attendance("7a", today()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recognize_after_mark_conflicts() {
        let (svc, _dir) = service(false).await;
        let v = base(5);
        let mut rng = StdRng::seed_from_u64(6);
        let samples: Vec<Vec<f32>> = (0..4).map(|_| noisy(&v, &mut rng)).collect();
        svc.enroll_face("s2", enroll_body(&samples, None)).await.unwrap();
        svc.mark(mark_body("s2", "7a", None)).await.unwrap();

        let result = svc.recognize(recognize_body("7a", None, &v)).await;
        let Err(ServiceError::AlreadyRecorded { matched: Some(m) }) = result else {
            panic!("expected conflict, got {result:?}");
        };
        assert_eq!(m.id, "s2");
        assert_eq!(svc.store.class_attendance("7a", today()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_marks_record_once() {
        let (svc, _dir) = service(false).await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move { svc.mark(mark_body("s1", "7a", None)).await }));
        }
        let mut created = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => created += 1,
                Err(ServiceError::AlreadyRecorded { .. }) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((created, conflicts), (1, 7));
    }

    #[tokio::test]
    async fn test_mismatched_lengths_rejected_before_write() {
        let (svc, dir) = service(false).await;
        let image = format!("data:image/png;base64,{}", STANDARD.encode(b"png"));
        let samples = vec![vec![0.1, 0.2, 0.3], vec![0.1, 0.2]];

        let err = svc
            .enroll_face("s1", enroll_body(&samples, Some(image)))
            .await
            .unwrap_err();
        let ServiceError::Validation(msg) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert!(msg.contains("sample 1"), "{msg}");

        let student = svc.store.find_student("s1").await.unwrap().unwrap();
        assert!(student.template.is_none());
        assert!(student.face_image_url.is_none());
        assert!(!dir.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn test_enroll_validation_messages() {
        let (svc, _dir) = service(false).await;
        let cases = [
            json!(null),
            json!([]),
            json!([[]]),
            json!([[0.1, "x"]]),
            json!([0.1, 0.2]),
        ];
        for descriptors in cases {
            let req = EnrollRequest { descriptors: descriptors.clone(), face_image: None };
            assert!(
                matches!(svc.enroll_face("s1", req).await, Err(ServiceError::Validation(_))),
                "accepted {descriptors}"
            );
        }
    }

    #[tokio::test]
    async fn test_enroll_keeps_at_most_max_samples() {
        let (svc, _dir) = service(false).await;
        let mut samples: Vec<Vec<f32>> = (0..15).map(|i| vec![i as f32, 0.0]).collect();
        // Extra samples beyond the cap are ignored, even malformed ones.
        samples.push(vec![1.0]);
        let resp = svc.enroll_face("s1", enroll_body(&samples, None)).await.unwrap();
        assert_eq!(resp.sample_count, 15);
        let student = svc.store.find_student("s1").await.unwrap().unwrap();
        assert_eq!(student.template.unwrap().sample_count(), 15);
    }

    #[tokio::test]
    async fn test_enroll_unknown_student() {
        let (svc, dir) = service(false).await;
        let image = format!("data:image/png;base64,{}", STANDARD.encode(b"png"));
        let err = svc
            .enroll_face("ghost", enroll_body(&[vec![0.1]], Some(image)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(!dir.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn test_enroll_photo_errors() {
        let (svc, _dir) = service(false).await;
        let big = format!("data:image/png;base64,{}", STANDARD.encode([0u8; 65]));
        let err = svc
            .enroll_face("s1", enroll_body(&[vec![0.1]], Some(big)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::PayloadTooLarge(_)));

        let err = svc
            .enroll_face("s1", enroll_body(&[vec![0.1]], Some("data:image/gif;base64,AAAA".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = svc
            .enroll_face("s1", enroll_body(&[vec![0.1]], Some("  ".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_enroll_writes_photo() {
        let (svc, _dir) = service(false).await;
        let image = format!("data:image/jpeg;base64,{}", STANDARD.encode(b"jpeg"));
        let resp = svc
            .enroll_face("s1", enroll_body(&[vec![0.1, 0.2]], Some(image)))
            .await
            .unwrap();
        let url = resp.face_image_url.unwrap();
        assert!(url.starts_with("/uploads/") && url.ends_with(".jpg"), "{url}");
    }

    #[tokio::test]
    async fn test_enroll_inline_photo() {
        let (svc, _dir) = service(true).await;
        let image = format!("data:image/webp;base64,{}", STANDARD.encode(b"webp"));
        let resp = svc
            .enroll_face("s1", enroll_body(&[vec![0.1, 0.2]], Some(image.clone())))
            .await
            .unwrap();
        assert_eq!(resp.face_image_url, Some(image));
    }

    #[tokio::test]
    async fn test_recognize_boundary_is_match() {
        let (svc, _dir) = service(false).await;
        svc.enroll_face("s1", enroll_body(&[vec![0.0]], None)).await.unwrap();

        let at = svc.recognize(recognize_body("7a", None, &[0.55])).await.unwrap();
        assert_eq!(at.matched.map(|m| m.id).as_deref(), Some("s1"));

        let beyond = svc.recognize(recognize_body("7a", None, &[0.56])).await.unwrap();
        assert!(beyond.matched.is_none());
        assert!((beyond.distance.unwrap() - 0.56).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_recognize_scoped_to_student() {
        let (svc, _dir) = service(false).await;
        svc.enroll_face("s1", enroll_body(&[vec![0.0, 0.0]], None)).await.unwrap();
        svc.enroll_face("s2", enroll_body(&[vec![1.0, 1.0]], None)).await.unwrap();

        // Only s2 is considered, so the probe near s1 does not match.
        let result = svc
            .recognize(recognize_body("7a", Some("s2"), &[0.0, 0.0]))
            .await
            .unwrap();
        assert!(result.matched.is_none());

        let err = svc
            .recognize(recognize_body("7b", Some("s1"), &[0.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_recognize_not_found_and_validation() {
        let (svc, _dir) = service(false).await;
        let err = svc.recognize(recognize_body("zz", None, &[0.0])).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        // Class exists but nobody in it is enrolled.
        let err = svc.recognize(recognize_body("7b", None, &[0.0])).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let err = svc.recognize(recognize_body("", None, &[0.0])).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = svc.recognize(recognize_body("7a", None, &[])).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_recognize_probe_of_other_length() {
        let (svc, _dir) = service(false).await;
        svc.enroll_face("s1", enroll_body(&[vec![0.0, 0.0]], None)).await.unwrap();
        let result = svc.recognize(recognize_body("7a", None, &[0.0])).await.unwrap();
        assert_eq!(result, RecognizeResponse { matched: None, distance: None });
    }

    #[tokio::test]
    async fn test_mark_errors() {
        let (svc, _dir) = service(false).await;
        assert!(matches!(
            svc.mark(mark_body("ghost", "7a", None)).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            svc.mark(mark_body("s3", "7a", None)).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            svc.mark(mark_body("s1", "7a", Some("LATE"))).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            svc.mark(mark_body("", "7a", None)).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_day_roll() {
        let (svc, _dir) = service(false).await;
        svc.enroll_face("s1", enroll_body(&[vec![0.0]], None)).await.unwrap();
        svc.mark(mark_body("s2", "7a", Some("PERMIT"))).await.unwrap();

        let roll = svc.day_roll("7a", None).await.unwrap();
        assert_eq!(roll.class.name, "VII A");
        assert_eq!(roll.date, today());
        let ayu = &roll.students[0];
        assert_eq!(ayu.id, "s2");
        assert_eq!(ayu.status, Some(AttendanceStatus::Permit));
        assert_eq!(ayu.check_in_time.as_ref().map(String::len), Some(5));
        assert!(!ayu.has_face);
        let budi = &roll.students[1];
        assert!(budi.has_face);
        assert_eq!(budi.status, None);

        let yesterday = today().pred_opt().unwrap();
        let past = svc.day_roll("7a", Some(yesterday)).await.unwrap();
        assert!(past.students.iter().all(|s| s.status.is_none()));

        assert!(matches!(svc.day_roll("zz", None).await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_status_counts() {
        let (svc, _dir) = service(false).await;
        svc.enroll_face("s1", enroll_body(&[vec![0.0]], None)).await.unwrap();
        let status = svc.status().await.unwrap();
        assert_eq!(status.counts, StoreCounts { classes: 2, students: 3, enrolled: 1 });
        assert_eq!(status.match_threshold, 0.55);
    }

    /// Checkerboard frame that clears the default quality gate.
    fn sharp_frame() -> hadir_hw::Frame {
        let (width, height) = (320u32, 240u32);
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = if ((x / 4) + (y / 4)) % 2 == 0 { 90 } else { 190 };
                data.extend([v, v, v]);
            }
        }
        hadir_hw::Frame::new(data, width, height, 0).unwrap()
    }

    /// Finite stream of one frame with increasing sequence numbers.
    struct ReplaySource {
        frame: hadir_hw::Frame,
        remaining: u32,
        next: u32,
    }

    impl hadir_hw::FrameSource for ReplaySource {
        fn open(&mut self) -> Result<(), hadir_hw::SourceError> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<hadir_hw::Frame, hadir_hw::SourceError> {
            if self.remaining == 0 {
                return Err(hadir_hw::SourceError::Exhausted);
            }
            self.remaining -= 1;
            let mut frame = self.frame.clone();
            frame.sequence = self.next;
            self.next += 1;
            Ok(frame)
        }

        fn close(&mut self) {}

        fn name(&self) -> &str {
            "replay"
        }
    }

    /// A face per descriptor, sliding right by `step` px each frame.
    fn recorded_faces(descriptors: Vec<Vec<f32>>, step: f32) -> hadir_core::ReplayExtractor {
        use hadir_core::extractor::RecordedDetection;
        use hadir_core::{BoundingBox, FaceDetection, Landmarks, Point};

        let recorded = descriptors
            .into_iter()
            .enumerate()
            .map(|(i, values)| {
                let x = 80.0 + step * i as f32;
                RecordedDetection {
                    sequence: i as u32,
                    face: Some(FaceDetection {
                        bbox: BoundingBox { x, y: 60.0, width: 120.0, height: 120.0, confidence: 0.9 },
                        landmarks: Landmarks {
                            left_eye: vec![Point { x: x + 36.0, y: 108.0 }],
                            right_eye: vec![Point { x: x + 84.0, y: 108.0 }],
                        },
                        descriptor: Embedding::new(values),
                    }),
                }
            })
            .collect();
        hadir_core::ReplayExtractor::new(recorded)
    }

    #[tokio::test]
    async fn test_capture_enroll_then_capture_recognize() {
        use hadir_core::{
            capture_enrollment, capture_probe, EnrollmentConfig, EnrollmentOutcome, ProbeConfig,
            ProbeOutcome, QualityGate,
        };
        use std::time::Duration;
        use tokio_util::sync::CancellationToken;

        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoStore::new(dir.path().join("uploads"), false);
        let svc = AttendanceService::new(seeded_store().await, photos, 0.55, 15, 2 * 1024 * 1024);
        let cancel = CancellationToken::new();
        let v = base(11);
        let mut rng = StdRng::seed_from_u64(12);

        let enrollment_faces = recorded_faces((0..6).map(|_| noisy(&v, &mut rng)).collect(), 15.0);
        let mut source = ReplaySource { frame: sharp_frame(), remaining: 60, next: 0 };
        let outcome = capture_enrollment(
            &mut source,
            &enrollment_faces,
            &QualityGate::default(),
            EnrollmentConfig {
                interval: Duration::ZERO,
                ..EnrollmentConfig::default()
            },
            &cancel,
            |_| {},
        )
        .await
        .unwrap();
        let EnrollmentOutcome::Succeeded(face) = outcome else {
            panic!("expected enrollment, got {outcome:?}");
        };

        let samples: Vec<Vec<f32>> = face.samples.iter().map(|s| s.values.clone()).collect();
        let photo = face.snapshot.as_ref().map(|s| s.to_data_url());
        assert!(photo.is_some());
        let enrolled = svc.enroll_face("s1", enroll_body(&samples, photo)).await.unwrap();
        assert_eq!(enrolled.sample_count, 6);
        assert!(enrolled.face_image_url.unwrap().starts_with("/uploads/"));

        let probe_faces = recorded_faces((0..3).map(|_| noisy(&v, &mut rng)).collect(), 0.0);
        let mut source = ReplaySource { frame: sharp_frame(), remaining: 6, next: 0 };
        let config = ProbeConfig {
            interval: Duration::ZERO,
            ..ProbeConfig::default()
        };
        let ProbeOutcome::Ready { probe, used } =
            capture_probe(&mut source, &probe_faces, &config, &cancel).await.unwrap()
        else {
            panic!("expected a probe");
        };
        assert_eq!(used, 3);

        let result = svc.recognize(recognize_body("7a", None, &probe.values)).await.unwrap();
        assert_eq!(result.matched.unwrap().id, "s1");
        assert!(result.distance.unwrap() <= 0.55);
    }
}
