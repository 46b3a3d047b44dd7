use tracing::info;

pub const SENSOR_ERROR_TEXT: &str = "Sensor ERROR!";

/// Screen capability of the device (an SSD1306 on real hardware).
pub trait Display: Send {
    fn render(&mut self, co2: u16, temperature: f32, humidity: f32);
    fn show_status(&mut self, message: &str);
    fn clear(&mut self);

    fn show_error(&mut self) {
        self.show_status(SENSOR_ERROR_TEXT);
    }
}

/// Air quality band printed under the CO2 value.
pub fn co2_band(co2: u16) -> &'static str {
    match co2 {
        0..=799 => "Good",
        800..=999 => "OK",
        1000..=1499 => "Ventilate!",
        _ => "CRITICAL!",
    }
}

/// The four text lines of the 128x64 screen layout.
pub fn frame_lines(co2: u16, temperature: f32, humidity: f32) -> [String; 4] {
    [
        format!("CO2: {co2} ppm"),
        co2_band(co2).to_string(),
        format!("Temp: {temperature:.1} C"),
        format!("Hum:  {humidity:.0} %"),
    ]
}

/// Logs frames instead of driving a panel.
#[derive(Default)]
pub struct ConsoleDisplay;

impl Display for ConsoleDisplay {
    fn render(&mut self, co2: u16, temperature: f32, humidity: f32) {
        let lines = frame_lines(co2, temperature, humidity);
        info!(target: "display", "{}", lines.join(" | "));
    }

    fn show_status(&mut self, message: &str) {
        info!(target: "display", status = message);
    }

    fn clear(&mut self) {
        info!(target: "display", "cleared");
    }
}
