/// Size of the primary display in physical pixels
#[cfg(windows)]
pub fn physical_desktop_dimensions() -> Option<(i32, i32)> {
    use windows::core::PCWSTR;
    use windows::Win32::Graphics::Gdi::{EnumDisplaySettingsW, DEVMODEW, ENUM_CURRENT_SETTINGS};

    let mut mode = DEVMODEW {
        dmSize: std::mem::size_of::<DEVMODEW>() as u16,
        ..Default::default()
    };
    unsafe { EnumDisplaySettingsW(PCWSTR::null(), ENUM_CURRENT_SETTINGS, &mut mode) }
        .as_bool()
        .then_some((mode.dmPelsWidth as i32, mode.dmPelsHeight as i32))
}

#[cfg(not(windows))]
pub fn physical_desktop_dimensions() -> Option<(i32, i32)> {
    None
}
