//! Event emitter (§4.I): a thin, independently named wrapper around the
//! log producer targeted at the alarm topic. `AlarmEvaluator::publish`
//! (alarm.rs) is the only caller; this module exists so the partition-key
//! convention for alarm events -- `"{location}-{metric}"` -- has one
//! documented home rather than being inlined at each call site.

use crate::alarm::ALARM_TOPIC;
use crate::error::Result;
use crate::log::LogProducer;
use crate::model::{AlarmEvent, MetricName};

pub async fn emit<P: LogProducer + ?Sized>(producer: &P, location: &str, metric: MetricName, event: &AlarmEvent) -> Result<()> {
    let key = AlarmEvent::partition_key(location, metric);
    let payload = serde_json::to_vec(event)?;
    producer.publish(ALARM_TOPIC, &key, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Operator;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct RecordingProducer {
        published: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl LogProducer for RecordingProducer {
        async fn publish(&self, topic: &str, key: &str, _value: &[u8]) -> Result<()> {
            self.published.lock().push((topic.to_string(), key.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn emits_on_alarm_topic_keyed_by_location_and_metric() {
        let producer = RecordingProducer { published: Mutex::new(Vec::new()) };
        let event = AlarmEvent::Triggered {
            zipcode: "90210".into(),
            city: "Beverly Hills".into(),
            metric: MetricName::Temperature,
            value: 31.0,
            threshold: 30.0,
            operator: Operator::Gt,
            duration_minutes: 10,
            start_time: chrono::Utc::now(),
            alarm_id: 1,
        };

        emit(&producer, "90210", MetricName::Temperature, &event).await.unwrap();

        let published = producer.published.lock();
        assert_eq!(published[0], ("alarm".to_string(), "90210-temperature".to_string()));
    }
}
