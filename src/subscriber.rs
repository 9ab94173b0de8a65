//! MQTT ingestion: broker event loop plus the per-message store path.
//!
//! The transport adapter ([`Subscriber::run`]) owns the `rumqttc` event loop and hands every
//! PUBLISH to [`Ingester::process`]. [`Ingester::handle`] is the broker-free
//! unit: stamp receipt time, normalize, insert one row.

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet, QoS,
    SubscribeReasonCode,
};
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::MqttSettings;
use crate::error::IngestError;
use crate::models::NewMeasurement;
use crate::normalize::normalize;

// ---

/// Subscriber connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

/// Result of a successfully stored message.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored {
    pub id: i64,
    pub device_id: String,
}

/// Writes one measurement per inbound message through an explicit pool handle.
#[derive(Debug, Clone)]
pub struct Ingester {
    pool: SqlitePool,
}

impl Ingester {
    // ---
    pub fn new(pool: SqlitePool) -> Self {
        Ingester { pool }
    }

    /// Normalize and store a single message.
    ///
    /// `timestamp_server` is taken before parsing so it reflects receipt time.
    #[tracing::instrument(level = "debug", skip(self, payload), fields(bytes = payload.len()))]
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Stored, IngestError> {
        // ---
        let timestamp_server = now_epoch_secs();
        let payload = normalize(payload)?;

        let row = NewMeasurement {
            topic: topic.to_owned(),
            timestamp_server,
            payload,
        };

        let id = insert_measurement(&self.pool, &row)
            .await
            .map_err(IngestError::StorageWrite)?;

        Ok(Stored {
            id,
            device_id: row.payload.device_id,
        })
    }

    /// Run [`Self::handle`] and log the outcome; never fails.
    pub async fn process(&self, topic: &str, payload: &[u8]) {
        // ---
        match self.handle(topic, payload).await {
            Ok(stored) => info!(id = stored.id, topic, "Stored data from {}", stored.device_id),
            Err(e @ IngestError::MalformedPayload(_)) => {
                warn!(topic, "Dropping message: {}", e)
            }
            Err(e) => error!(topic, "Dropping message: {}", e),
        }
    }
}

/// Current wall-clock time in whole epoch seconds.
pub fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Insert one row and return its storage-assigned id.
pub async fn insert_measurement(pool: &SqlitePool, row: &NewMeasurement) -> Result<i64, sqlx::Error> {
    // ---
    let p = &row.payload;
    let result = sqlx::query(
        r#"
        INSERT INTO measurements (
            device_id, topic,
            dht22_temperature_c, dht22_humidity_percent,
            bmp280_temperature_c, bmp280_pressure_pa,
            timestamp_device, timestamp_server,
            firmware_version, rssi, altitude_m, free_heap
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&p.device_id)
    .bind(&row.topic)
    .bind(p.dht22_temperature_c)
    .bind(p.dht22_humidity_percent)
    .bind(p.bmp280_temperature_c)
    .bind(p.bmp280_pressure_pa)
    .bind(p.timestamp_device)
    .bind(row.timestamp_server)
    .bind(p.firmware_version.as_deref())
    .bind(p.rssi)
    .bind(p.altitude_m)
    .bind(p.free_heap)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Build client options; credentials are only set when both are configured.
pub fn mqtt_options(settings: &MqttSettings) -> MqttOptions {
    // ---
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(settings.keep_alive);

    if let Some((username, password)) = settings.credentials() {
        options.set_credentials(username, password);
    }
    options
}

/// Owns the broker session and publishes its [`ConnectionState`].
pub struct Subscriber {
    settings: MqttSettings,
    ingester: Ingester,
    state: watch::Sender<ConnectionState>,
}

impl Subscriber {
    // ---
    pub fn new(settings: MqttSettings, ingester: Ingester) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Subscriber {
            settings,
            ingester,
            state,
        }
    }

    /// Receiver that observes every state transition.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            debug!("MQTT state {:?} -> {:?}", from, to);
        }
    }

    /// Enter `Subscribed` only when the broker granted every filter.
    fn on_suback(&self, codes: &[SubscribeReasonCode]) {
        // ---
        let granted = !codes.is_empty()
            && codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_)));

        if granted {
            info!("Subscribed to {}", self.settings.topic);
            self.set_state(ConnectionState::Subscribed);
        } else {
            error!(
                "Broker refused subscription to {}: {:?}",
                self.settings.topic, codes
            );
        }
    }

    /// Drive the broker connection forever, storing every received message.
    ///
    /// Connection failures are logged and the loop keeps polling; `rumqttc`
    /// reconnects on the next poll. The topic filter is subscribed after every
    /// successful CONNACK since sessions are clean.
    pub async fn run(self) {
        // ---
        let settings = &self.settings;
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(settings), 10);

        info!("MQTT listener started");

        loop {
            if self.current() == ConnectionState::Disconnected {
                self.set_state(ConnectionState::Connecting);
            }

            let failure = match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                    info!("Connected to MQTT broker {}:{}", settings.host, settings.port);
                    self.set_state(ConnectionState::Connected);

                    if let Err(e) = client.try_subscribe(settings.topic.as_str(), QoS::AtMostOnce) {
                        error!("Failed to queue subscription to {}: {}", settings.topic, e);
                    }
                    None
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    Some(IngestError::ConnectionRefused(ack.code))
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    self.on_suback(&ack.return_codes);
                    None
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.ingester.process(&publish.topic, &publish.payload).await;
                    None
                }
                Ok(_) => None,
                Err(ConnectionError::ConnectionRefused(code)) => {
                    Some(IngestError::ConnectionRefused(code))
                }
                Err(e) => Some(IngestError::Connection(e)),
            };

            if let Some(e) = failure {
                error!("MQTT connection failed: {}", e);
                self.set_state(ConnectionState::Disconnected);
                tokio::time::sleep(settings.retry_delay).await;
            }
        }
    }
}

/// Run a [`Subscriber`] for `settings` until the task is dropped.
pub async fn run(settings: &MqttSettings, ingester: Ingester) {
    Subscriber::new(settings.clone(), ingester).run().await
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{Measurement, UNKNOWN_DEVICE};
    use crate::schema::{ensure_schema, tests::memory_pool};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};
    use tokio_test::{assert_err, assert_ok};

    async fn ingester() -> Ingester {
        // ---
        let pool = memory_pool().await;
        ensure_schema(&pool).await.unwrap();
        Ingester::new(pool)
    }

    async fn count(ingester: &Ingester) -> i64 {
        // ---
        sqlx::query_scalar("SELECT COUNT(*) FROM measurements")
            .fetch_one(&ingester.pool)
            .await
            .unwrap()
    }

    async fn fetch(ingester: &Ingester, id: i64) -> Measurement {
        // ---
        sqlx::query_as::<_, Measurement>("SELECT * FROM measurements WHERE id = ?")
            .bind(id)
            .fetch_one(&ingester.pool)
            .await
            .unwrap()
    }

    fn settings() -> MqttSettings {
        // ---
        MqttSettings {
            host: "broker.lan".into(),
            port: 1884,
            username: None,
            password: None,
            topic: "sensors/#".into(),
            client_id: "meteo-test".into(),
            keep_alive: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_handle_stores_full_payload() {
        // ---
        let ingester = ingester().await;
        let payload = br#"{
            "device_id": "esp32-attic", "fw": "2.0.1", "ts_device": 1760000123,
            "rssi": -71, "altitude_m": 295.0, "free_heap": 120000,
            "dht22": {"temperature_c": 19.5, "humidity_percent": 55.25},
            "bmp280": {"temperature_c": 19.75, "pressure_pa": 97012.5}
        }"#;

        let before = now_epoch_secs();
        let stored = assert_ok!(ingester.handle("sensors/attic", payload).await);
        let after = now_epoch_secs();

        assert_eq!(stored.device_id, "esp32-attic");
        let row = fetch(&ingester, stored.id).await;
        assert_eq!(row.topic, "sensors/attic");
        assert_eq!(row.firmware_version.as_deref(), Some("2.0.1"));
        assert_eq!(row.timestamp_device, Some(1_760_000_123));
        assert_eq!(row.rssi, Some(-71));
        assert_eq!(row.altitude_m, Some(295.0));
        assert_eq!(row.free_heap, Some(120_000));
        assert_eq!(row.dht22_temperature_c, Some(19.5));
        assert_eq!(row.dht22_humidity_percent, Some(55.25));
        assert_eq!(row.bmp280_temperature_c, Some(19.75));
        assert_eq!(row.bmp280_pressure_pa, Some(97_012.5));
        assert!(row.timestamp_server >= before && row.timestamp_server <= after);
    }

    #[tokio::test]
    async fn test_malformed_payload_writes_nothing() {
        // ---
        let ingester = ingester().await;

        let err = assert_err!(ingester.handle("sensors/x", b"temperature=21").await);
        assert!(matches!(err, IngestError::MalformedPayload(_)));
        assert_eq!(count(&ingester).await, 0);

        // process() swallows the failure
        ingester.process("sensors/x", &[0xc3, 0x28]).await;
        assert_eq!(count(&ingester).await, 0);
    }

    #[tokio::test]
    async fn test_missing_device_id_is_stored_as_sentinel() {
        // ---
        let ingester = ingester().await;

        let stored = assert_ok!(ingester.handle("sensors/anon", br#"{"rssi": -80}"#).await);
        let row = fetch(&ingester, stored.id).await;

        assert_eq!(row.device_id, UNKNOWN_DEVICE);
        assert_eq!(row.rssi, Some(-80));
        assert_eq!(row.dht22_temperature_c, None);
        assert_eq!(row.firmware_version, None);
    }

    #[tokio::test]
    async fn test_storage_failure_is_isolated() {
        // ---
        let ingester = ingester().await;
        sqlx::query("DROP TABLE measurements")
            .execute(&ingester.pool)
            .await
            .unwrap();

        let err = assert_err!(ingester.handle("sensors/a", br#"{"device_id": "a"}"#).await);
        assert!(matches!(err, IngestError::StorageWrite(_)));
        ingester.process("sensors/a", br#"{"device_id": "a"}"#).await;

        // Same ingester keeps working once storage is healthy again
        ensure_schema(&ingester.pool).await.unwrap();
        assert_ok!(ingester.handle("sensors/a", br#"{"device_id": "a"}"#).await);
        assert_eq!(count(&ingester).await, 1);
    }

    #[tokio::test]
    async fn test_ids_increase() {
        // ---
        let ingester = ingester().await;

        let first = ingester.handle("sensors/a", b"{}").await.unwrap();
        let second = ingester.handle("sensors/a", b"{}").await.unwrap();

        assert!(second.id > first.id);
    }

    #[test]
    fn test_mqtt_options() {
        // ---
        let options = mqtt_options(&settings());
        assert_eq!(options.broker_address(), ("broker.lan".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(options.credentials(), None);

        let mut with_auth = settings();
        with_auth.username = Some("meteo".into());
        with_auth.password = Some("s3cret".into());
        let options = mqtt_options(&with_auth);
        assert_eq!(
            options.credentials(),
            Some(("meteo".to_string(), "s3cret".to_string()))
        );
    }

    #[tokio::test]
    async fn test_suback_failure_keeps_connected() {
        // ---
        let subscriber = Subscriber::new(settings(), ingester().await);
        let state = subscriber.state();
        subscriber.set_state(ConnectionState::Connected);

        subscriber.on_suback(&[SubscribeReasonCode::Failure]);
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        subscriber.on_suback(&[
            SubscribeReasonCode::Success(QoS::AtMostOnce),
            SubscribeReasonCode::Failure,
        ]);
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        subscriber.on_suback(&[]);
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        subscriber.on_suback(&[SubscribeReasonCode::Success(QoS::AtMostOnce)]);
        assert_eq!(*state.borrow(), ConnectionState::Subscribed);
    }

    // Minimal MQTT 3.1.1 broker side, just enough for one client session

    const CONNECT: u8 = 1;
    const SUBSCRIBE: u8 = 8;

    /// Read one packet, returning its type and body.
    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        // ---
        let header = stream.read_u8().await.unwrap();
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.unwrap();
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await.unwrap();
        (header >> 4, body)
    }

    fn connack(code: u8) -> [u8; 4] {
        [0x20, 0x02, 0x00, code]
    }

    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        // ---
        let remaining = 2 + topic.len() + payload.len();
        assert!(remaining < 128, "single-byte remaining length only");

        let mut packet = vec![0x30, remaining as u8, 0, topic.len() as u8];
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    /// Accept one client, grant the connection, answer its SUBSCRIBE with
    /// `suback_code`, deliver `publish`, then hold the socket open until the
    /// client goes away. Returns the subscribed filter.
    async fn serve_session(listener: TcpListener, suback_code: u8, publish: Vec<u8>) -> String {
        // ---
        let (mut stream, _) = listener.accept().await.unwrap();
        assert_eq!(read_packet(&mut stream).await.0, CONNECT);
        stream.write_all(&connack(0)).await.unwrap();

        let (kind, body) = read_packet(&mut stream).await;
        assert_eq!(kind, SUBSCRIBE);
        let filter_len = u16::from_be_bytes([body[2], body[3]]) as usize;
        let filter = String::from_utf8(body[4..4 + filter_len].to_vec()).unwrap();

        stream
            .write_all(&[0x90, 0x03, body[0], body[1], suback_code])
            .await
            .unwrap();
        stream.write_all(&publish).await.unwrap();

        let mut rest = [0u8; 64];
        while matches!(stream.read(&mut rest).await, Ok(n) if n > 0) {}
        filter
    }

    async fn local_broker() -> (TcpListener, MqttSettings) {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = MqttSettings {
            host: "127.0.0.1".into(),
            port: listener.local_addr().unwrap().port(),
            retry_delay: Duration::from_millis(50),
            ..settings()
        };
        (listener, settings)
    }

    async fn wait_for_rows(ingester: &Ingester, expected: i64) {
        // ---
        timeout(Duration::from_secs(5), async {
            while count(ingester).await < expected {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("rows were not stored in time");
    }

    #[tokio::test]
    async fn test_run_subscribes_and_stores_publish() {
        // ---
        let ingester = ingester().await;
        let (listener, settings) = local_broker().await;
        let publish = publish_packet("sensors/attic", br#"{"device_id":"esp32-attic","rssi":-70}"#);
        let broker = tokio::spawn(serve_session(listener, 0x00, publish));

        let subscriber = Subscriber::new(settings, ingester.clone());
        let mut state = subscriber.state();
        let task = tokio::spawn(subscriber.run());

        timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Subscribed),
        )
        .await
        .expect("never subscribed")
        .unwrap();
        wait_for_rows(&ingester, 1).await;

        task.abort();
        let filter = timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
        assert_eq!(filter, "sensors/#");

        let row: Measurement = sqlx::query_as("SELECT * FROM measurements")
            .fetch_one(&ingester.pool)
            .await
            .unwrap();
        assert_eq!(row.topic, "sensors/attic");
        assert_eq!(row.device_id, "esp32-attic");
        assert_eq!(row.rssi, Some(-70));
    }

    #[tokio::test]
    async fn test_run_refused_subscription_stays_connected() {
        // ---
        let ingester = ingester().await;
        let (listener, settings) = local_broker().await;
        let publish = publish_packet("sensors/attic", br#"{"device_id":"esp32-attic"}"#);
        let broker = tokio::spawn(serve_session(listener, 0x80, publish));

        let subscriber = Subscriber::new(settings, ingester.clone());
        let state = subscriber.state();
        let task = tokio::spawn(subscriber.run());

        // The PUBLISH follows the SUBACK, so once it is stored the SUBACK was handled
        wait_for_rows(&ingester, 1).await;
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        task.abort();
        let _ = timeout(Duration::from_secs(5), broker).await;
    }

    #[tokio::test]
    async fn test_run_reconnects_after_refused_connack() {
        // ---
        let ingester = ingester().await;
        let (listener, settings) = local_broker().await;
        let (attempts_tx, mut attempts) = mpsc::unbounded_channel();

        let broker = tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                assert_eq!(read_packet(&mut stream).await.0, CONNECT);
                // 5: not authorized
                stream.write_all(&connack(5)).await.unwrap();
                if attempts_tx.send(()).is_err() {
                    break;
                }
            }
        });

        let subscriber = Subscriber::new(settings, ingester.clone());
        let state = subscriber.state();
        let task = tokio::spawn(subscriber.run());

        for _ in 0..3 {
            timeout(Duration::from_secs(5), attempts.recv())
                .await
                .expect("client did not reconnect")
                .unwrap();
        }

        let current = *state.borrow();
        assert!(
            matches!(current, ConnectionState::Disconnected | ConnectionState::Connecting),
            "unexpected state {:?}",
            current
        );
        assert_eq!(count(&ingester).await, 0);

        task.abort();
        broker.abort();
    }
}
