use chrono::Utc;
use rand::Rng;

use sensornet_domain::{IotDevice, SensorDataMessage};

/// A synthetic reading for the given device: T in 20-30C, humidity in
/// 30-70%, CO2 in 400-600 ppm, stamped with the current wall clock.
pub fn generate_reading(device: &IotDevice) -> SensorDataMessage {
    let mut rng = rand::thread_rng();
    SensorDataMessage {
        device_id: device.device_id.clone(),
        device_name: device.name.clone(),
        device_type: device.device_type.to_string(),
        location: device.location.clone(),
        floor: device.floor,
        zone: device.zone,
        temperature: rng.gen_range(20.0..30.0),
        humidity: rng.gen_range(30.0..70.0),
        co2: rng.gen_range(400.0..600.0),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use sensornet_domain::DeviceType;

    fn device() -> IotDevice {
        IotDevice {
            id: 1,
            device_id: "D-01".to_string(),
            name: "Lobby-T".to_string(),
            device_type: DeviceType::Multi,
            location: "HQ".to_string(),
            floor: 1,
            zone: 2,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn values_stay_in_range() {
        let device = device();
        for _ in 0..1_000 {
            let reading = generate_reading(&device);
            assert!((20.0..30.0).contains(&reading.temperature));
            assert!((30.0..70.0).contains(&reading.humidity));
            assert!((400.0..600.0).contains(&reading.co2));
        }
    }

    #[test]
    fn descriptors_are_copied_from_the_device() {
        let reading = generate_reading(&device());
        assert_eq!(reading.device_id, "D-01");
        assert_eq!(reading.device_name, "Lobby-T");
        assert_eq!(reading.device_type, "multi");
        assert_eq!(reading.location, "HQ");
        assert_eq!(reading.floor, 1);
        assert_eq!(reading.zone, 2);
    }
}
