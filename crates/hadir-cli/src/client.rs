//! JSON client for the hadird HTTP API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("cannot reach hadird: {0}")]
    Http(#[from] reqwest::Error),
    #[error("hadird returned {status}: {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub full_name: String,
    pub student_number: String,
    pub gender: String,
    pub class_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recognition {
    Matched { student: Student, distance: Option<f32> },
    NoMatch { distance: Option<f32> },
    /// Matched, but already recorded today.
    AlreadyRecorded { student: Option<Student> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Marked {
    Recorded(Value),
    AlreadyRecorded,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrolled {
    pub id: String,
    pub face_image_url: Option<String>,
    pub sample_count: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnrollBody<'a> {
    descriptors: &'a [Vec<f32>],
    #[serde(skip_serializing_if = "Option::is_none")]
    face_image: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognizeBody<'a> {
    class_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    student_id: Option<&'a str>,
    descriptor: &'a [f32],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkBody<'a> {
    student_id: &'a str,
    class_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'a str>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    #[serde(rename = "match")]
    matched: Option<Student>,
}

#[derive(Deserialize)]
struct RecognizeReply {
    #[serde(rename = "match")]
    matched: Option<Student>,
    distance: Option<f32>,
}

pub struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    pub fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn status(&self) -> Result<Value, ClientError> {
        let resp = self.http.get(self.url("/status")).send().await?;
        read_json(resp).await
    }

    pub async fn enroll_face(
        &self,
        student_id: &str,
        descriptors: &[Vec<f32>],
        face_image: Option<&str>,
    ) -> Result<Enrolled, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/students/{student_id}/enroll-face")))
            .json(&EnrollBody {
                descriptors,
                face_image,
            })
            .send()
            .await?;
        read_json(resp).await
    }

    pub async fn recognize(
        &self,
        class_id: &str,
        student_id: Option<&str>,
        descriptor: &[f32],
    ) -> Result<Recognition, ClientError> {
        let resp = self
            .http
            .post(self.url("/attendance/recognize"))
            .json(&RecognizeBody {
                class_id,
                student_id,
                descriptor,
            })
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            let body: ErrorBody = resp.json().await?;
            return Ok(Recognition::AlreadyRecorded {
                student: body.matched,
            });
        }
        let reply: RecognizeReply = read_json(resp).await?;
        Ok(match reply.matched {
            Some(student) => Recognition::Matched {
                student,
                distance: reply.distance,
            },
            None => Recognition::NoMatch {
                distance: reply.distance,
            },
        })
    }

    pub async fn mark(
        &self,
        student_id: &str,
        class_id: &str,
        status: Option<&str>,
    ) -> Result<Marked, ClientError> {
        let resp = self
            .http
            .post(self.url("/attendance/mark"))
            .json(&MarkBody {
                student_id,
                class_id,
                status,
            })
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Ok(Marked::AlreadyRecorded);
        }
        Ok(Marked::Recorded(read_json(resp).await?))
    }

    pub async fn roll(&self, class_id: &str, date: Option<&str>) -> Result<Value, ClientError> {
        let mut query = vec![("classId", class_id)];
        if let Some(date) = date {
            query.push(("date", date));
        }
        let resp = self
            .http
            .get(self.url("/attendance"))
            .query(&query)
            .send()
            .await?;
        read_json(resp).await
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(ClientError::Api {
        status: status.as_u16(),
        message: error_message(&text),
    })
}

/// The `error` field of an error body, or the raw text.
fn error_message(text: &str) -> String {
    serde_json::from_str::<ErrorBody>(text)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| text.trim().to_string())
}
