use std::collections::HashMap;

use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::Message;

/// Unique identifier of a consumed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageId {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: String,
}

/// A broker record carrying an opaque payload plus string headers, detached
/// from the client's borrow so it can outlive the poll loop.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub id: MessageId,
    pub value: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    pub(crate) fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(borrowed) = msg.headers() {
            for header in borrowed.iter() {
                if let Some(value) = header.value {
                    headers.insert(
                        header.key.to_string(),
                        String::from_utf8_lossy(value).into_owned(),
                    );
                }
            }
        }

        Self {
            id: MessageId {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key,
            },
            value: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
            headers,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_message(partition: i32, offset: i64, value: &[u8]) -> ConsumerMessage {
    ConsumerMessage {
        id: MessageId {
            topic: "iot-readings".to_string(),
            partition,
            offset,
            key: format!("k-{offset}"),
        },
        value: value.to_vec(),
        headers: HashMap::new(),
    }
}
