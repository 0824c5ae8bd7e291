//! Kubernetes Event recording for the fleet networking controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "ServiceNotFound")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "serviceexport-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// An event captured by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Name of the object the event was about
    pub object: String,
    /// Normal or Warning
    pub type_: EventType,
    /// Event reason
    pub reason: String,
    /// Event note
    pub note: Option<String>,
}

/// Keeps every published event in memory so tests can assert on them
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far, oldest first
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Reasons of the events published so far, oldest first
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push(RecordedEvent {
            object: resource_ref.name.clone().unwrap_or_default(),
            type_,
            reason: reason.to_string(),
            note,
        });
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Conflict report-back
    /// The hub found the exported Service in conflict with other clusters
    pub const SERVICE_EXPORT_CONFLICT_FOUND: &str = "ServiceExportConflictFound";
    /// The hub resolved the exported Service without conflict
    pub const NO_SERVICE_EXPORT_CONFLICT_FOUND: &str = "NoServiceExportConflictFound";

    // Export validation
    /// The Service behind a ServiceExport does not exist
    pub const SERVICE_NOT_FOUND: &str = "ServiceNotFound";
    /// The Service behind a ServiceExport cannot be exported
    pub const SERVICE_NOT_ELIGIBLE: &str = "ServiceNotEligible";
    /// The ServiceExport is valid
    pub const VALID_SERVICE_EXPORT: &str = "ValidServiceExport";
    /// The export is waiting for the hub to resolve conflicts
    pub const PENDING_EXPORT_CONFLICT_RESOLUTION: &str = "PendingExportConflictResolution";
    /// The weight annotation on a ServiceExport cannot be used
    pub const SERVICE_EXPORT_INVALID_WEIGHT_ANNOTATION: &str = "ServiceExportInvalidWeightAnnotation";
    /// A ServiceExport with weight 0 was withdrawn from the fleet
    pub const SERVICE_EXPORT_ZERO_WEIGHT: &str = "ServiceExportZeroWeight";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Copying a hub decision back into the member cluster
    pub const REPORT_BACK: &str = "ReportBack";
    /// Validating and exporting a Service
    pub const EXPORT: &str = "Export";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<RecordingEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(
            reasons::SERVICE_EXPORT_CONFLICT_FOUND,
            "ServiceExportConflictFound"
        );
        assert_eq!(reasons::SERVICE_NOT_ELIGIBLE, "ServiceNotEligible");
    }

    #[tokio::test]
    async fn recording_publisher_keeps_events_in_order() {
        let publisher = RecordingEventPublisher::new();
        let obj_ref = ObjectReference {
            name: Some("app".to_string()),
            ..Default::default()
        };
        publisher
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::SERVICE_NOT_FOUND,
                actions::EXPORT,
                Some("service work/app is not found".to_string()),
            )
            .await;
        publisher
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::VALID_SERVICE_EXPORT,
                actions::EXPORT,
                None,
            )
            .await;

        assert_eq!(
            publisher.reasons(),
            vec!["ServiceNotFound", "ValidServiceExport"]
        );
        assert_eq!(publisher.events()[0].object, "app");
        assert_eq!(publisher.events()[0].type_, EventType::Warning);
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                reasons::VALID_SERVICE_EXPORT,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }
}
