use tracing::info;

/// The game's UI is laid out for 16:9
pub const NATIVE_ASPECT: f32 = 16.0 / 9.0;

/// Aspect ratio and the 16:9 HUD rectangle centred inside a resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AspectLayout {
    pub width: i32,
    pub height: i32,
    pub aspect_ratio: f32,
    pub aspect_multiplier: f32,
    pub hud_width: f32,
    pub hud_height: f32,
    pub hud_width_offset: f32,
    pub hud_height_offset: f32,
}

impl AspectLayout {
    /// `None` for a resolution with no area
    pub fn new(width: i32, height: i32) -> Option<Self> {
        if width <= 0 || height <= 0 {
            return None;
        }
        let (w, h) = (width as f32, height as f32);
        let aspect_ratio = w / h;

        // wider than 16:9 pillarboxes the HUD, narrower letterboxes it
        let (hud_width, hud_height, hud_width_offset, hud_height_offset) =
            if aspect_ratio < NATIVE_ASPECT {
                let hud_height = w / NATIVE_ASPECT;
                (w, hud_height, 0.0, (h - hud_height) / 2.0)
            } else {
                let hud_width = h * NATIVE_ASPECT;
                (hud_width, h, (w - hud_width) / 2.0, 0.0)
            };

        Some(Self {
            width,
            height,
            aspect_ratio,
            aspect_multiplier: aspect_ratio / NATIVE_ASPECT,
            hud_width,
            hud_height,
            hud_width_offset,
            hud_height_offset,
        })
    }

    pub fn log(&self) {
        info!("----------");
        info!(
            "Current Resolution: Resolution: {}x{}",
            self.width, self.height
        );
        info!("Current Resolution: fAspectRatio: {}", self.aspect_ratio);
        info!(
            "Current Resolution: fAspectMultiplier: {}",
            self.aspect_multiplier
        );
        info!("Current Resolution: fHUDWidth: {}", self.hud_width);
        info!("Current Resolution: fHUDHeight: {}", self.hud_height);
        info!(
            "Current Resolution: fHUDWidthOffset: {}",
            self.hud_width_offset
        );
        info!(
            "Current Resolution: fHUDHeightOffset: {}",
            self.hud_height_offset
        );
        info!("----------");
    }
}
