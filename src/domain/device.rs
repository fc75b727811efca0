/// What a supported watch model can do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub display_name: &'static str,
    pub manufacturer_name: &'static str,
    pub supports_weather: bool,
    pub supports_location: bool,
    pub auto_connect: bool,
}

pub const BANGLE_JS: DeviceProfile = DeviceProfile {
    display_name: "Bangle.js",
    manufacturer_name: "Espruino",
    supports_weather: true,
    supports_location: true,
    auto_connect: true,
};

impl Default for DeviceProfile {
    fn default() -> Self {
        BANGLE_JS
    }
}

impl DeviceProfile {
    /// Weather pushes need both the forecast and the place it is for.
    pub fn accepts_weather(&self) -> bool {
        self.supports_weather && self.supports_location
    }
}
