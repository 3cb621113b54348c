//! services/api/src/adapters/calendar.rs
//!
//! This module contains the adapter for Google Calendar.
//! It implements the `CalendarService` port: creating an invite with a Meet link and
//! reading a psychologist's busy periods for the availability filter.

use async_trait::async_trait;
use booking_core::domain::CalendarEvent;
use booking_core::ports::{CalendarEventRequest, CalendarService, PortError, PortResult};
use booking_core::slots::BusyInterval;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

const GOOGLE_CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3";

/// The token blob stored on a psychologist row.
#[derive(Debug, Deserialize)]
struct CalendarCredentials {
    access_token: String,
    #[serde(default = "primary_calendar")]
    calendar_id: String,
}

fn primary_calendar() -> String {
    "primary".to_string()
}

fn parse_credentials(raw: &str) -> PortResult<CalendarCredentials> {
    let creds: CalendarCredentials = serde_json::from_str(raw)
        .map_err(|e| PortError::Unexpected(format!("Calendar credentials unreadable: {}", e)))?;
    if creds.access_token.trim().is_empty() {
        return Err(PortError::Unexpected("Calendar access token is empty".to_string()));
    }
    Ok(creds)
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

#[derive(Clone)]
pub struct GoogleCalendarAdapter {
    client: reqwest::Client,
    base_url: String,
    fallback_meet_link: String,
    offset: FixedOffset,
}

impl GoogleCalendarAdapter {
    /// `offset` is used to place all-day events on the platform's local day.
    pub fn new(timeout: Duration, fallback_meet_link: String, offset: FixedOffset) -> PortResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PortError::Unexpected(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: GOOGLE_CALENDAR_API.to_string(),
            fallback_meet_link,
            offset,
        })
    }

    fn fallback(&self) -> CalendarEvent {
        CalendarEvent {
            event_id: None,
            meet_link: self.fallback_meet_link.clone(),
            event_link: None,
        }
    }

    async fn insert_event(
        &self,
        creds: &CalendarCredentials,
        event: &CalendarEventRequest,
    ) -> PortResult<CalendarEvent> {
        let url = format!(
            "{}/calendars/{}/events?conferenceDataVersion=1&sendUpdates=all",
            self.base_url, creds.calendar_id
        );
        let attendees: Vec<Value> = event
            .attendees
            .iter()
            .map(|email| json!({ "email": email }))
            .collect();
        let body = json!({
            "summary": event.summary,
            "description": event.description,
            "start": { "dateTime": event.start.to_rfc3339() },
            "end": { "dateTime": event.end.to_rfc3339() },
            "attendees": attendees,
            "conferenceData": {
                "createRequest": {
                    "requestId": Uuid::new_v4().to_string(),
                    "conferenceSolutionKey": { "type": "hangoutsMeet" }
                }
            }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&creds.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| PortError::Unexpected(format!("Calendar request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(PortError::Unexpected(format!(
                "Calendar insert returned {}",
                response.status()
            )));
        }
        let created: Value = response
            .json()
            .await
            .map_err(|e| PortError::Unexpected(format!("Calendar response unreadable: {}", e)))?;
        Ok(event_from_response(&created, &self.fallback_meet_link))
    }
}

/// Picks the join link: `hangoutLink`, else the first video entry point, else the fallback.
fn event_from_response(created: &Value, fallback: &str) -> CalendarEvent {
    let video = created["conferenceData"]["entryPoints"]
        .as_array()
        .and_then(|points| {
            points
                .iter()
                .find(|p| p["entryPointType"] == "video")
                .and_then(|p| p["uri"].as_str())
        });
    let meet_link = created["hangoutLink"]
        .as_str()
        .or(video)
        .unwrap_or(fallback)
        .to_string();
    CalendarEvent {
        event_id: created["id"].as_str().map(str::to_string),
        meet_link,
        event_link: created["htmlLink"].as_str().map(str::to_string),
    }
}

/// Reads either `dateTime` or an all-day `date` (local midnight in `offset`).
fn event_time(value: &Value, offset: FixedOffset) -> Option<DateTime<Utc>> {
    if let Some(raw) = value["dateTime"].as_str() {
        return DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value["date"].as_str()?, "%Y-%m-%d").ok()?;
    offset
        .from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

fn busy_from_items(body: &Value, offset: FixedOffset) -> Vec<BusyInterval> {
    let Some(items) = body["items"].as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter(|item| item["status"] != "cancelled" && item["transparency"] != "transparent")
        .filter_map(|item| {
            Some(BusyInterval {
                summary: item["summary"].as_str().unwrap_or_default().to_string(),
                start: event_time(&item["start"], offset)?,
                end: event_time(&item["end"], offset)?,
            })
        })
        .collect()
}

//=========================================================================================
// `CalendarService` Trait Implementation
//=========================================================================================

#[async_trait]
impl CalendarService for GoogleCalendarAdapter {
    async fn create_event(
        &self,
        credentials: Option<&str>,
        event: &CalendarEventRequest,
    ) -> PortResult<CalendarEvent> {
        let Some(raw) = credentials else {
            return Ok(self.fallback());
        };
        let creds = match parse_credentials(raw) {
            Ok(creds) => creds,
            Err(e) => {
                warn!("Calendar credentials rejected, using fallback link: {}", e);
                return Ok(self.fallback());
            }
        };
        match self.insert_event(&creds, event).await {
            Ok(created) => Ok(created),
            Err(e) => {
                warn!("Calendar invite failed, using fallback link: {}", e);
                Ok(self.fallback())
            }
        }
    }

    async fn list_busy(
        &self,
        credentials: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> PortResult<Vec<BusyInterval>> {
        let creds = parse_credentials(credentials)?;
        let url = format!("{}/calendars/{}/events", self.base_url, creds.calendar_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&creds.access_token)
            .query(&[
                ("timeMin", from.to_rfc3339()),
                ("timeMax", to.to_rfc3339()),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
            ])
            .send()
            .await
            .map_err(|e| PortError::Unexpected(format!("Calendar request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(PortError::Unexpected(format!(
                "Calendar list returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| PortError::Unexpected(format!("Calendar response unreadable: {}", e)))?;
        Ok(busy_from_items(&body, self.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(19800).unwrap()
    }

    #[test]
    fn all_day_events_cover_the_local_day() {
        let body = json!({
            "items": [
                { "summary": "Out of office", "start": { "date": "2026-01-10" }, "end": { "date": "2026-01-11" } },
                { "summary": "Dentist", "start": { "dateTime": "2026-01-10T10:00:00+05:30" }, "end": { "dateTime": "2026-01-10T11:00:00+05:30" } },
                { "summary": "Free time", "transparency": "transparent", "start": { "dateTime": "2026-01-10T12:00:00Z" }, "end": { "dateTime": "2026-01-10T13:00:00Z" } },
                { "summary": "Gone", "status": "cancelled", "start": { "dateTime": "2026-01-10T12:00:00Z" }, "end": { "dateTime": "2026-01-10T13:00:00Z" } }
            ]
        });
        let busy = busy_from_items(&body, ist());
        assert_eq!(busy.len(), 2);
        assert_eq!(busy[0].start.to_rfc3339(), "2026-01-09T18:30:00+00:00");
        assert_eq!(busy[0].end.to_rfc3339(), "2026-01-10T18:30:00+00:00");
        assert_eq!(busy[1].start.to_rfc3339(), "2026-01-10T04:30:00+00:00");
    }

    #[test]
    fn meet_link_prefers_hangout_link_then_video_entry() {
        let with_hangout = json!({ "id": "e1", "hangoutLink": "https://meet.google.com/abc", "htmlLink": "https://cal/e1" });
        let event = event_from_response(&with_hangout, "https://fallback");
        assert_eq!(event.meet_link, "https://meet.google.com/abc");
        assert_eq!(event.event_id.as_deref(), Some("e1"));

        let with_entry = json!({
            "id": "e2",
            "conferenceData": { "entryPoints": [
                { "entryPointType": "phone", "uri": "tel:+1" },
                { "entryPointType": "video", "uri": "https://meet.google.com/xyz" }
            ]}
        });
        assert_eq!(event_from_response(&with_entry, "https://fallback").meet_link, "https://meet.google.com/xyz");
        assert_eq!(event_from_response(&json!({}), "https://fallback").meet_link, "https://fallback");
    }

    #[tokio::test]
    async fn missing_or_broken_credentials_fall_back() {
        let adapter = GoogleCalendarAdapter::new(Duration::from_secs(1), "https://meet.google.com/".into(), ist()).unwrap();
        let request = CalendarEventRequest {
            summary: "Therapy Session with Asha".into(),
            description: String::new(),
            start: Utc::now(),
            end: Utc::now(),
            attendees: vec![],
        };
        let event = adapter.create_event(None, &request).await.unwrap();
        assert_eq!(event.meet_link, "https://meet.google.com/");
        let event = adapter.create_event(Some("not json"), &request).await.unwrap();
        assert_eq!(event.event_id, None);
        assert!(adapter.list_busy("not json", Utc::now(), Utc::now()).await.is_err());
    }
}
