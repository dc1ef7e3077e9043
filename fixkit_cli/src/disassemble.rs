use colored::{ColoredString, Colorize};
use fixkit_image::{file::ImageFile, scanner::Pattern};
use iced_x86::{
    Decoder, DecoderOptions, Formatter, FormatterOutput, FormatterTextKind, IntelFormatter,
};

#[derive(Default)]
struct Output {
    pub buffer: String,
}

impl FormatterOutput for Output {
    fn write(&mut self, text: &str, kind: FormatterTextKind) {
        #[allow(clippy::unnecessary_to_owned)]
        self.buffer.push_str(&get_color(text, kind).to_string());
    }
}

/// Whether decoding from `address` lands on `address + offset`. A hook offset that falls
/// inside an instruction means the signature is wrong for this build.
pub(crate) fn on_instruction_boundary(data: &[u8], address: usize, offset: usize) -> bool {
    let target = (address + offset) as u64;
    Decoder::with_ip(64, data, address as u64, DecoderOptions::NONE)
        .into_iter()
        .take_while(|instruction| instruction.ip() <= target && !instruction.is_invalid())
        .any(|instruction| instruction.ip() == target)
}

/// Instructions of a match, bytes covered by the pattern highlighted and the hook byte
/// reversed
pub(crate) fn disassemble(file: &ImageFile, address: usize, pattern: &Pattern) -> String {
    let trailing = 32;
    let mut output = Output::default();

    let Some(section) = file.section_containing(address) else {
        return format!("{address:016x}\nno section");
    };
    output.buffer.push_str(&format!(
        "{:016x}\n{:016x} - {:016x} = {}\n\n",
        address,
        section.address,
        section.address + section.data.len(),
        section.name,
    ));

    let start = address - section.address;
    let end = (start + pattern.len() + trailing).min(section.data.len());
    let data = &section.data[start..end];
    let hook = pattern.hook_address(address) as u64;

    let mut formatter = IntelFormatter::new();
    formatter.options_mut().set_first_operand_char_index(8);
    for instruction in Decoder::with_ip(64, data, address as u64, DecoderOptions::NONE) {
        let ip = format!("{:016x}", instruction.ip());
        if instruction.ip() == hook {
            #[allow(clippy::unnecessary_to_owned)]
            output.buffer.push_str(&ip.reversed().to_string());
        } else {
            output.buffer.push_str(&ip);
        }
        output.buffer.push_str(":  ");

        let index = instruction.ip() as usize - address;
        for (i, b) in data[index..index + instruction.len()].iter().enumerate() {
            let highlight = pattern
                .simple
                .mask
                .get(index + i)
                .map(|m| *m != 0)
                .unwrap_or_default();
            let s = format!("{b:02x}");
            let mut colored = if highlight {
                s.bright_white()
            } else {
                s.bright_black()
            };
            if instruction.ip() + i as u64 == hook {
                colored = colored.reversed();
            }
            #[allow(clippy::unnecessary_to_owned)]
            output.buffer.push_str(&colored.to_string());
            output.buffer.push(' ');
        }

        for _ in 0..8usize.saturating_sub(instruction.len()) {
            output.buffer.push_str("   ");
        }

        formatter.format(&instruction, &mut output);
        output.buffer.push('\n');
    }
    output.buffer
}

fn get_color(s: &str, kind: FormatterTextKind) -> ColoredString {
    match kind {
        FormatterTextKind::Directive | FormatterTextKind::Keyword => s.bright_yellow(),
        FormatterTextKind::Prefix | FormatterTextKind::Mnemonic => s.bright_red(),
        FormatterTextKind::Register => s.bright_blue(),
        FormatterTextKind::Number => s.bright_cyan(),
        _ => s.white(),
    }
}
