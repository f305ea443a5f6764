//! Per-dispatch view of one claimed job.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use switchyard_core::keys::job_key;
use switchyard_core::record::FIELD_ID;
use switchyard_core::{
    ChannelName, FieldValue, JobId, JobRecord, RouteAction, RouteToken, SessionId, encode_fields,
};

use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("field `{0}` is not set on the job")]
    MissingField(String),

    #[error("field `{field}` is not valid JSON for the requested type: {source}")]
    Json {
        field: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a handler sees while processing one job.
///
/// Field writes go straight to the store and mark the context as mutated;
/// a mutated job is routed through the command log instead of the fast path.
/// Handlers finish with [`WatchContext::route`] / [`WatchContext::route_with`]
/// or [`WatchContext::no_op`]; returning no token releases the claim only.
pub struct WatchContext<'a> {
    id: JobId,
    channel: ChannelName,
    record: JobRecord,
    session: SessionId,
    store: &'a dyn Store,
    mutated: bool,
}

impl<'a> WatchContext<'a> {
    pub(crate) fn new(
        id: JobId,
        channel: ChannelName,
        record: JobRecord,
        session: SessionId,
        store: &'a dyn Store,
    ) -> Self {
        Self {
            id,
            channel,
            record,
            session,
            store,
            mutated: false,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Channel the job was claimed from.
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Record as loaded at claim time, plus writes made through this context.
    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn has_changes(&self) -> bool {
        self.mutated
    }

    pub fn string(&self, field: &str) -> &str {
        self.record.string(field)
    }

    pub fn int(&self, field: &str) -> i64 {
        self.record.int(field)
    }

    pub fn float(&self, field: &str) -> f64 {
        self.record.float(field)
    }

    pub fn bool(&self, field: &str) -> bool {
        self.record.bool(field)
    }

    pub fn time(&self, field: &str) -> DateTime<Utc> {
        self.record.time(field)
    }

    pub fn set_field(
        &mut self,
        field: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> Result<(), ContextError> {
        self.set_fields([(field.into(), value.into())])
    }

    /// Write fields to the job record. `id` is immutable and skipped.
    pub fn set_fields<K, V>(
        &mut self,
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), ContextError>
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        let fields: Vec<(String, String)> = encode_fields(fields)
            .into_iter()
            .filter(|(field, _)| {
                if field == FIELD_ID {
                    warn!(job_id = %self.id, "handler tried to overwrite the job id; ignored");
                    return false;
                }
                true
            })
            .collect();
        if fields.is_empty() {
            return Ok(());
        }

        // Marked before the write: a failed HSET may still have landed.
        self.mutated = true;
        self.store.set_fields(&job_key(&self.id), &fields)?;
        self.record.extend(fields);
        Ok(())
    }

    /// Store `value` as a JSON string field.
    pub fn set_object<T: Serialize>(&mut self, field: &str, value: &T) -> Result<(), ContextError> {
        let json = serde_json::to_value(value).map_err(|source| ContextError::Json {
            field: field.to_string(),
            source,
        })?;
        self.set_field(field, FieldValue::Json(json))
    }

    /// Decode a JSON string field, read fresh from the store.
    pub fn get_object<T: DeserializeOwned>(&self, field: &str) -> Result<T, ContextError> {
        let raw = self
            .store
            .get_field(&job_key(&self.id), field)?
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| ContextError::MissingField(field.to_string()))?;
        serde_json::from_str(&raw).map_err(|source| ContextError::Json {
            field: field.to_string(),
            source,
        })
    }

    /// Advance the job into `channel`.
    pub fn route(&mut self, channel: &ChannelName) -> RouteToken {
        self.token(RouteAction::Advance(channel.clone()))
    }

    /// Write `fields`, then advance the job into `channel`. A failed write is
    /// logged and the job still counts as mutated.
    pub fn route_with<K, V>(
        &mut self,
        channel: &ChannelName,
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> RouteToken
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        if let Err(e) = self.set_fields(fields) {
            error!(job_id = %self.id, channel = %channel, error = %e, "failed to write fields while routing");
        }
        self.route(channel)
    }

    /// Drop the job: its record is deleted and a delete is logged.
    pub fn no_op(&self) -> RouteToken {
        self.token(RouteAction::Delete)
    }

    fn token(&self, action: RouteAction) -> RouteToken {
        RouteToken::new(self.id.clone(), action, self.session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Address {
        city: String,
        zip: u32,
    }

    fn context(store: &InMemoryStore) -> WatchContext<'_> {
        let mut record = JobRecord::new();
        record.insert("id", "j1");
        record.insert("count", 2i64);
        WatchContext::new(
            JobId::new("j1").unwrap(),
            ChannelName::new("intake").unwrap(),
            record,
            SessionId::new(),
            store,
        )
    }

    #[test]
    fn reads_are_typed_and_forgiving() {
        let store = InMemoryStore::new();
        let ctx = context(&store);
        assert_eq!(ctx.int("count"), 2);
        assert_eq!(ctx.int("missing"), 0);
        assert!(!ctx.bool("missing"));
        assert_eq!(ctx.time("missing"), DateTime::<Utc>::default());
        assert!(!ctx.has_changes());
    }

    #[test]
    fn set_fields_writes_through_and_marks_mutated() {
        let store = InMemoryStore::new();
        let mut ctx = context(&store);
        ctx.set_field("status", "processed").unwrap();

        assert!(ctx.has_changes());
        assert_eq!(ctx.string("status"), "processed");
        assert_eq!(
            store.get_field("sq_job_j1", "status").unwrap().as_deref(),
            Some("processed")
        );
    }

    #[test]
    fn id_field_is_immutable() {
        let store = InMemoryStore::new();
        let mut ctx = context(&store);
        ctx.set_field("id", "other").unwrap();

        assert!(!ctx.has_changes());
        assert_eq!(ctx.record().id(), "j1");
        assert!(!store.exists("sq_job_j1").unwrap());
    }

    #[test]
    fn objects_roundtrip_as_json_fields() {
        let store = InMemoryStore::new();
        let mut ctx = context(&store);
        let addr = Address {
            city: "Lagos".into(),
            zip: 100001,
        };
        ctx.set_object("address", &addr).unwrap();

        assert_eq!(ctx.string("address"), r#"{"city":"Lagos","zip":100001}"#);
        assert_eq!(ctx.get_object::<Address>("address").unwrap(), addr);
        assert!(matches!(
            ctx.get_object::<Address>("nope"),
            Err(ContextError::MissingField(_))
        ));
    }

    #[test]
    fn get_object_reports_bad_json() {
        let store = InMemoryStore::new();
        let mut ctx = context(&store);
        ctx.set_field("address", "not json").unwrap();
        assert!(matches!(
            ctx.get_object::<Address>("address"),
            Err(ContextError::Json { .. })
        ));
    }

    #[test]
    fn terminal_operations_issue_session_tokens() {
        let store = InMemoryStore::new();
        let mut ctx = context(&store);
        let done = ChannelName::new("done").unwrap();

        let token = ctx.route_with(&done, [("status", "processed")]);
        assert_eq!(token.action(), &RouteAction::Advance(done));
        assert!(token.is_issued_for(ctx.id(), ctx.session()));
        assert!(ctx.has_changes());

        let drop = ctx.no_op();
        assert_eq!(drop.action(), &RouteAction::Delete);
    }
}
