use std::sync::Arc;

use fixkit_hook::{patch_bytes, Context, MidHook};
use fixkit_image::ModuleImage;
use tracing::{error, info};

use crate::aspect::AspectLayout;
use crate::config::GAME_FRAMERATE;
use crate::signatures::{Signature, ASPECT_RATIO, FRAMERATE_LIMIT, PILLARBOXING, RESOLUTION};
use crate::state::FixState;

/// The applied fixes. Hooks stay installed for as long as this lives, which for the DLL is
/// the rest of the process.
pub struct Fix {
    state: Arc<FixState>,
    hooks: Vec<MidHook>,
}

impl Fix {
    /// Scan `module` and apply every enabled fix. A fix that cannot be found or installed is
    /// logged and skipped.
    ///
    /// # Safety
    /// `module` must be live code of the current process.
    pub unsafe fn apply(module: &ModuleImage, state: Arc<FixState>) -> Self {
        let mut fix = Self {
            state,
            hooks: vec![],
        };
        fix.resolution(module);
        fix.aspect_ratio(module);
        fix.framerate(module);
        fix
    }
    pub fn state(&self) -> &Arc<FixState> {
        &self.state
    }
    pub fn hooks(&self) -> &[MidHook] {
        &self.hooks
    }

    unsafe fn resolution(&mut self, module: &ModuleImage) {
        let Some(address) = find(module, &RESOLUTION) else {
            return;
        };
        let state = self.state.clone();
        self.hook(&RESOLUTION, address, move |ctx| {
            resolution_callback(&state, ctx)
        });
    }

    unsafe fn aspect_ratio(&mut self, module: &ModuleImage) {
        if !self.state.settings.fix_aspect {
            return;
        }

        if let Some(address) = find(module, &ASPECT_RATIO) {
            self.hook(&ASPECT_RATIO, address, aspect_ratio_callback);
        }

        if let Some(address) = find(module, &PILLARBOXING) {
            match patch_bytes(address, &[0x00]) {
                Ok(_) => info!("{}: Patched instruction.", PILLARBOXING.name),
                Err(e) => error!("{}: Failed to patch instruction: {e:#}", PILLARBOXING.name),
            }
        }
    }

    unsafe fn framerate(&mut self, module: &ModuleImage) {
        let limit = self.state.settings.framerate_limit;
        if limit == GAME_FRAMERATE {
            return;
        }
        if let Some(address) = find(module, &FRAMERATE_LIMIT) {
            self.hook(&FRAMERATE_LIMIT, address, move |ctx| {
                framerate_callback(limit, ctx)
            });
        }
    }

    unsafe fn hook<F>(&mut self, signature: &Signature, address: usize, callback: F)
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        match MidHook::install(address, callback) {
            Ok(hook) => {
                info!("{}: Hook installed.", signature.name);
                self.hooks.push(hook);
            }
            Err(e) => error!("{}: Failed to install hook: {e:#}", signature.name),
        }
    }
}

/// Address the fix applies to, logging the outcome of the scan either way
fn find(module: &ModuleImage, signature: &Signature) -> Option<usize> {
    let pattern = match signature.pattern() {
        Ok(pattern) => pattern,
        Err(e) => {
            error!("{e:#}");
            return None;
        }
    };
    match module.scan(&pattern) {
        Some(address) => {
            info!(
                "{}: Address is {}+{:x}",
                signature.name,
                module.name(),
                address - module.base()
            );
            Some(pattern.hook_address(address))
        }
        None => {
            error!("{}: Pattern scan failed.", signature.name);
            None
        }
    }
}

pub fn resolution_callback(state: &FixState, ctx: &mut Context) {
    let settings = &state.settings;
    if settings.custom_resolution {
        ctx.set_rsi(settings.custom_width as u64);
        ctx.set_rbx(settings.custom_height as u64);
    }

    let (width, height) = (ctx.rsi() as i32, ctx.rbx() as i32);
    if state.current.update(width, height) {
        if let Some(layout) = AspectLayout::new(width, height) {
            layout.log();
        }
    }
}

pub fn aspect_ratio_callback(ctx: &mut Context) {
    let aspect_ratio = ctx.xmm5().f32(0);
    ctx.xmm8().set_f32(0, aspect_ratio);
}

pub fn framerate_callback(limit: i32, ctx: &mut Context) {
    ctx.set_rcx(limit as u64);
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use fixkit_hook::memory::{read_bytes, ExecBlock};
    use fixkit_hook::Registers;
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;
    use crate::config::{Config, Settings};

    /// Log output of everything run inside [`Captured::run`]
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Self;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl Captured {
        fn run<R>(f: impl FnOnce() -> R) -> (R, String) {
            let captured = Self::default();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(captured.clone())
                .with_ansi(false)
                .finish();
            let result = tracing::subscriber::with_default(subscriber, f);
            let log = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
            (result, log)
        }
    }

    fn settings() -> Settings {
        Settings {
            custom_resolution: false,
            custom_width: 0,
            custom_height: 0,
            framerate_limit: 60,
            fix_aspect: false,
        }
    }

    #[test]
    fn resolution_callback_tracks_resolution() {
        let state = FixState::new(settings());
        let mut registers = Registers {
            rsi: 2560,
            rbx: 1080,
            ..Default::default()
        };
        resolution_callback(&state, &mut Context::new(&mut registers));
        assert_eq!((2560, 1080), (registers.rsi, registers.rbx));
        assert_eq!((2560, 1080), state.current.get());
    }

    #[test]
    fn resolution_callback_applies_custom_resolution() {
        let state = FixState::new(Settings {
            custom_resolution: true,
            custom_width: 3440,
            custom_height: 1440,
            ..settings()
        });
        let mut registers = Registers {
            rsi: 1920,
            rbx: 1080,
            ..Default::default()
        };
        resolution_callback(&state, &mut Context::new(&mut registers));
        assert_eq!((3440, 1440), (registers.rsi, registers.rbx));
        assert_eq!((3440, 1440), state.current.get());
    }

    #[test]
    fn aspect_ratio_and_framerate_callbacks() {
        let mut registers = Registers::default();
        registers.xmm[5].set_f32(0, 2.37);
        registers.xmm[8].set_f32(0, 1.77);
        registers.xmm[8].set_f32(1, 5.0);
        aspect_ratio_callback(&mut Context::new(&mut registers));
        assert_eq!(2.37, registers.xmm[8].f32(0));
        assert_eq!(5.0, registers.xmm[8].f32(1));

        framerate_callback(144, &mut Context::new(&mut registers));
        assert_eq!(144, registers.rcx);
    }

    /// Aspect ratio signature as real instructions followed by `ret`
    const ASPECT_RATIO_CODE: [u8; 33] = [
        0x0f, 0x28, 0xc5, // movaps xmm0,xmm5
        0xf3, 0x0f, 0x10, 0x4d, 0x08, // movss xmm1,[rbp+8]
        0xf3, 0x0f, 0x59, 0x4d, 0x0c, // mulss xmm1,[rbp+0xc]
        0xf3, 0x0f, 0x5e, 0xc1, // divss xmm0,xmm1
        0x0f, 0x57, 0xd2, // xorps xmm2,xmm2
        0xf3, 0x0f, 0x58, 0xc2, // addss xmm0,xmm2
        0x0f, 0x28, 0xc8, // movaps xmm1,xmm0
        0xf3, 0x0f, 0x11, 0x45, 0x10, // movss [rbp+0x10],xmm0
        0xc3,
    ];

    const PILLARBOXING_CODE: [u8; 24] = [
        0xc6, 0x41, 0x10, 0x01, // mov byte ptr [rcx+0x10],1
        0xe8, 0x00, 0x00, 0x00, 0x00, // call
        0x48, 0x8b, 0xc8, // mov rcx,rax
        0x48, 0x8b, 0xd0, // mov rdx,rax
        0x48, 0x83, 0xc4, 0x28, 0x90, // add rsp,0x28; nop
        0x48, 0xff, 0x60, 0x08, // jmp [rax+8]
    ];

    #[test]
    fn apply_installs_enabled_fixes() {
        let block = ExecBlock::alloc(0x1000).unwrap();
        unsafe {
            block.write(0, &[0xcc; 0x1000]).unwrap();
            block.write(0x40, &ASPECT_RATIO_CODE).unwrap();
            block.write(0x100, &PILLARBOXING_CODE).unwrap();
        }
        let memory = unsafe { std::slice::from_raw_parts(block.address() as *const u8, 0x1000) };
        let module = ModuleImage::from_parts("game.exe", memory, 0);

        let state = Arc::new(FixState::new(Settings {
            fix_aspect: true,
            ..settings()
        }));
        let (fix, log) = Captured::run(|| unsafe { Fix::apply(&module, state) });
        assert!(log.contains("Aspect Ratio: Address is game.exe+40"));
        assert!(log.contains("Aspect Ratio: Hook installed."));
        assert!(log.contains("Pillarboxing: Patched instruction."));
        assert!(log.contains("Resolution: Pattern scan failed."));
        assert!(!log.contains("Framerate Limit:"));

        // resolution and framerate are not present, framerate is also disabled at 60
        assert_eq!(1, fix.hooks().len());
        assert_eq!(block.address() + 0x40, fix.hooks()[0].target());
        assert_eq!(0x00, unsafe { read_bytes(block.address() + 0x103, 1) }[0]);

        drop(fix);
        assert_eq!(ASPECT_RATIO_CODE.to_vec(), unsafe {
            read_bytes(block.address() + 0x40, ASPECT_RATIO_CODE.len())
        });
        // byte patches are permanent
        assert_eq!(0x00, unsafe { read_bytes(block.address() + 0x103, 1) }[0]);
    }

    #[test]
    fn apply_skips_disabled_fixes() {
        let block = ExecBlock::alloc(0x1000).unwrap();
        unsafe {
            block.write(0, &[0xcc; 0x1000]).unwrap();
            block.write(0x40, &ASPECT_RATIO_CODE).unwrap();
            block.write(0x100, &PILLARBOXING_CODE).unwrap();
        }
        let memory = unsafe { std::slice::from_raw_parts(block.address() as *const u8, 0x1000) };
        let module = ModuleImage::from_parts("game.exe", memory, 0);

        let fix = unsafe { Fix::apply(&module, Arc::new(FixState::new(settings()))) };
        assert!(fix.hooks().is_empty());
        assert_eq!(0x01, unsafe { read_bytes(block.address() + 0x103, 1) }[0]);
        assert_eq!(60, fix.state().settings.framerate_limit);
    }

    /// Framerate signature as real instructions
    const FRAMERATE_CODE: [u8; 26] = [
        0x0f, 0x4c, 0xc8, // cmovl ecx,eax
        0x89, 0x8b, 0x10, 0x01, 0x00, 0x00, // mov [rbx+0x110],ecx
        0xe8, 0x00, 0x00, 0x00, 0x00, // call
        0x88, 0x83, 0x14, 0x01, 0x00, 0x00, // mov [rbx+0x114],al
        0x48, 0x83, 0xc4, 0x20, // add rsp,0x20
        0x5b, // pop rbx
        0xc3,
    ];

    #[test]
    fn missing_framerate_limit_lifts_the_limit() {
        let block = ExecBlock::alloc(0x1000).unwrap();
        unsafe {
            block.write(0, &[0xcc; 0x1000]).unwrap();
            block.write(0x200, &FRAMERATE_CODE).unwrap();
        }
        let memory = unsafe { std::slice::from_raw_parts(block.address() as *const u8, 0x1000) };
        let module = ModuleImage::from_parts("game.exe", memory, 0);

        let settings = Settings::from_config(&Config::parse("").unwrap());
        assert_eq!(0, settings.framerate_limit);
        let (fix, log) =
            Captured::run(|| unsafe { Fix::apply(&module, Arc::new(FixState::new(settings))) });

        assert_eq!(1, fix.hooks().len());
        assert_eq!(block.address() + 0x200, fix.hooks()[0].target());
        assert!(log.contains("Framerate Limit: Hook installed."));
    }
}
