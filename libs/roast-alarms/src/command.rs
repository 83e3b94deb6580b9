//! Button, slider and alarm command language
//!
//! A command string is a `;`-separated sequence of bare keywords (`CHARGE`,
//! `PID ON`, `RESET`, ...) and calls (`write(1,4,{})`, `setSV(220)`,
//! `popup(text)`, ...). Placeholders are substituted before parsing: `{}`
//! is the bound value times factor plus offset, and `{ET}`, `{BT}`,
//! `{time}`, `{ETB}`, `{BTB}` are current readings.

use crate::error::{AlarmError, Result};
use crate::events::RoastEvent;

/// One parsed command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Event(RoastEvent),
    PidOn,
    PidOff,
    PidToggle,
    Reset,
    /// `write(slave,register,value)`: single register
    Write { slave: u8, register: u16, value: f64 },
    /// `writem(slave,register,v1,v2,...)`: consecutive registers
    WriteMultiple { slave: u8, register: u16, values: Vec<f64> },
    /// `writeWord(slave,register,value)`: 32-bit float over two registers
    WriteWord { slave: u8, register: u16, value: f64 },
    WriteBcd { slave: u8, register: u16, value: f64 },
    WriteCoil { slave: u8, register: u16, value: bool },
    WriteCoils { slave: u8, register: u16, values: Vec<bool> },
    /// `mwrite(slave,register,and,or)`: mask write
    MaskWrite { slave: u8, register: u16, and_mask: u16, or_mask: u16 },
    SetDbInt { db: u16, start: u32, value: i64 },
    SetDbFloat { db: u16, start: u32, value: f64 },
    SetDbBool { db: u16, start: u32, bit: u8, value: bool },
    SetSv(f64),
    /// `pidmode(n)`: 0 manual, 1 ramp/soak, 2 background follow
    PidMode(u8),
    Sleep(f64),
    Button(u32),
    Slider { slider: u8, value: f64 },
    PopUp(String),
    Color(String),
}

/// Values available to placeholders
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    /// Value of the button or slider that issued the command
    pub value: Option<f64>,
    pub factor: f64,
    pub offset: f64,
    pub et: Option<f64>,
    pub bt: Option<f64>,
    pub etb: Option<f64>,
    pub btb: Option<f64>,
    /// Seconds since recording start
    pub time: Option<f64>,
}

impl Bindings {
    /// Bind a slider/event value with the given scaling
    pub fn value(value: f64, factor: f64, offset: f64) -> Self {
        Self {
            value: Some(value),
            factor,
            offset,
            ..Self::default()
        }
    }
}

/// Replace placeholders in `template`
pub fn substitute(template: &str, bindings: &Bindings) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            return Err(AlarmError::parse(template, "unterminated placeholder"));
        };
        let name = after[..close].trim();
        let value = match name {
            "" => bindings
                .value
                .map(|value| value * bindings.factor + bindings.offset),
            "ET" => bindings.et,
            "BT" => bindings.bt,
            "ETB" => bindings.etb,
            "BTB" => bindings.btb,
            "time" => bindings.time,
            other => {
                return Err(AlarmError::parse(
                    template,
                    format!("unknown placeholder {{{other}}}"),
                ))
            },
        };
        let value = value.ok_or_else(|| AlarmError::UnboundPlaceholder(name.to_string()))?;
        out.push_str(&format_number(value));
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Shortest decimal form; integral values print without a fraction
fn format_number(value: f64) -> String {
    let rounded = (value * 1e6).round() / 1e6;
    format!("{rounded}")
}

/// Substitute placeholders, then parse
pub fn parse_with(template: &str, bindings: &Bindings) -> Result<Vec<Command>> {
    parse_commands(&substitute(template, bindings)?)
}

/// Parse a command string without placeholders
pub fn parse_commands(input: &str) -> Result<Vec<Command>> {
    split_top_level(input, ';')
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_one)
        .collect()
}

fn parse_one(text: &str) -> Result<Command> {
    match text {
        "PID ON" | "PIDon" => return Ok(Command::PidOn),
        "PID OFF" | "PIDoff" => return Ok(Command::PidOff),
        "PIDtoggle" => return Ok(Command::PidToggle),
        "RESET" => return Ok(Command::Reset),
        _ => {},
    }
    if let Ok(event) = text.parse::<RoastEvent>() {
        return Ok(Command::Event(event));
    }

    let Some(open) = text.find('(') else {
        return Err(AlarmError::parse(text, "unknown keyword"));
    };
    if !text.ends_with(')') {
        return Err(AlarmError::parse(text, "missing ')'"));
    }
    let name = text[..open].trim();
    let body = &text[open + 1..text.len() - 1];
    let args = Args::new(text, body);

    let command = match name {
        "write" => {
            args.expect(3)?;
            Command::Write {
                slave: args.int(0)?,
                register: args.int(1)?,
                value: args.number(2)?,
            }
        },
        "writem" => {
            args.at_least(3)?;
            Command::WriteMultiple {
                slave: args.int(0)?,
                register: args.int(1)?,
                values: (2..args.len()).map(|i| args.number(i)).collect::<Result<_>>()?,
            }
        },
        "writeWord" => {
            args.expect(3)?;
            Command::WriteWord {
                slave: args.int(0)?,
                register: args.int(1)?,
                value: args.number(2)?,
            }
        },
        "writeBCD" => {
            args.expect(3)?;
            Command::WriteBcd {
                slave: args.int(0)?,
                register: args.int(1)?,
                value: args.number(2)?,
            }
        },
        "wcoil" => {
            args.expect(3)?;
            Command::WriteCoil {
                slave: args.int(0)?,
                register: args.int(1)?,
                value: args.boolean(2)?,
            }
        },
        "wcoils" => {
            args.expect(3)?;
            Command::WriteCoils {
                slave: args.int(0)?,
                register: args.int(1)?,
                values: args.bool_list(2)?,
            }
        },
        "mwrite" => {
            args.expect(4)?;
            Command::MaskWrite {
                slave: args.int(0)?,
                register: args.int(1)?,
                and_mask: args.int(2)?,
                or_mask: args.int(3)?,
            }
        },
        "setDBint" => {
            args.expect(3)?;
            Command::SetDbInt {
                db: args.int(0)?,
                start: args.int(1)?,
                value: args.int(2)?,
            }
        },
        "setDBfloat" => {
            args.expect(3)?;
            Command::SetDbFloat {
                db: args.int(0)?,
                start: args.int(1)?,
                value: args.number(2)?,
            }
        },
        "setDBbool" => {
            args.expect(4)?;
            let bit: u8 = args.int(2)?;
            if bit > 7 {
                return Err(AlarmError::parse(text, format!("bit {bit} out of range 0..=7")));
            }
            Command::SetDbBool {
                db: args.int(0)?,
                start: args.int(1)?,
                bit,
                value: args.boolean(3)?,
            }
        },
        "setSV" => {
            args.expect(1)?;
            Command::SetSv(args.number(0)?)
        },
        "pidmode" => {
            args.expect(1)?;
            let mode: u8 = args.int(0)?;
            if mode > 2 {
                return Err(AlarmError::parse(text, format!("PID mode {mode} out of range 0..=2")));
            }
            Command::PidMode(mode)
        },
        "sleep" => {
            args.expect(1)?;
            let secs = args.number(0)?;
            if secs < 0.0 {
                return Err(AlarmError::parse(text, "negative sleep"));
            }
            Command::Sleep(secs)
        },
        "button" => {
            args.expect(1)?;
            Command::Button(args.int(0)?)
        },
        "slider" => {
            args.expect(2)?;
            let slider: u8 = args.int(0)?;
            if !(1..=4).contains(&slider) {
                return Err(AlarmError::parse(text, format!("slider {slider} out of range 1..=4")));
            }
            Command::Slider {
                slider,
                value: args.number(1)?,
            }
        },
        // Free text keeps its commas
        "popup" => Command::PopUp(body.trim().to_string()),
        "color" => {
            let color = body.trim();
            if color.is_empty() {
                return Err(AlarmError::parse(text, "missing colour"));
            }
            Command::Color(color.to_string())
        },
        other => return Err(AlarmError::parse(text, format!("unknown command '{other}'"))),
    };
    Ok(command)
}

/// Split on `sep` outside of parentheses and brackets
fn split_top_level(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (index, ch) in input.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&input[start..index]);
                start = index + ch.len_utf8();
            },
            _ => {},
        }
    }
    parts.push(&input[start..]);
    parts
}

struct Args<'a> {
    command: &'a str,
    items: Vec<&'a str>,
}

impl<'a> Args<'a> {
    fn new(command: &'a str, body: &'a str) -> Self {
        let items = if body.trim().is_empty() {
            Vec::new()
        } else {
            split_top_level(body, ',').into_iter().map(str::trim).collect()
        };
        Self { command, items }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn error(&self, reason: impl Into<String>) -> AlarmError {
        AlarmError::parse(self.command, reason)
    }

    fn expect(&self, count: usize) -> Result<()> {
        if self.items.len() != count {
            return Err(self.error(format!(
                "expected {count} arguments, got {}",
                self.items.len()
            )));
        }
        Ok(())
    }

    fn at_least(&self, count: usize) -> Result<()> {
        if self.items.len() < count {
            return Err(self.error(format!(
                "expected at least {count} arguments, got {}",
                self.items.len()
            )));
        }
        Ok(())
    }

    fn item(&self, index: usize) -> Result<&'a str> {
        self.items
            .get(index)
            .copied()
            .ok_or_else(|| self.error(format!("missing argument {}", index + 1)))
    }

    fn number(&self, index: usize) -> Result<f64> {
        let item = self.item(index)?;
        parse_number(item)
            .filter(|value| value.is_finite())
            .ok_or_else(|| self.error(format!("'{item}' is not a number")))
    }

    /// Integer argument; decimal or 0x-prefixed hex
    fn int<T: TryFrom<i64>>(&self, index: usize) -> Result<T> {
        let item = self.item(index)?;
        let value = match item.strip_prefix("0x").or_else(|| item.strip_prefix("0X")) {
            Some(hex) => i64::from_str_radix(hex, 16).ok(),
            None => parse_number(item)
                .filter(|value| value.fract() == 0.0 && value.is_finite())
                .map(|value| value as i64),
        };
        value
            .and_then(|value| T::try_from(value).ok())
            .ok_or_else(|| self.error(format!("'{item}' is not a valid integer here")))
    }

    fn boolean(&self, index: usize) -> Result<bool> {
        let item = self.item(index)?;
        parse_bool(item).ok_or_else(|| self.error(format!("'{item}' is not a boolean")))
    }

    fn bool_list(&self, index: usize) -> Result<Vec<bool>> {
        let item = self.item(index)?;
        let inner = item
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| self.error(format!("'{item}' is not a [..] list")))?;
        inner
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                parse_bool(part).ok_or_else(|| self.error(format!("'{part}' is not a boolean")))
            })
            .collect()
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim() {
        "1" | "true" | "True" | "ON" | "on" => Some(true),
        "0" | "false" | "False" | "OFF" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_keywords() {
        let commands = parse_commands("CHARGE; PID ON;PIDoff ; FCs;RESET;PIDtoggle").unwrap();
        assert_eq!(
            commands,
            vec![
                Command::Event(RoastEvent::Charge),
                Command::PidOn,
                Command::PidOff,
                Command::Event(RoastEvent::FcStart),
                Command::Reset,
                Command::PidToggle,
            ]
        );
    }

    #[test]
    fn test_modbus_calls() {
        let commands =
            parse_commands("write(1,4,220);writem(2,10,1,2,3);mwrite(1,0,0xFF00,0x0012);wcoils(1,3,[1,0,true])")
                .unwrap();
        assert_eq!(
            commands,
            vec![
                Command::Write {
                    slave: 1,
                    register: 4,
                    value: 220.0
                },
                Command::WriteMultiple {
                    slave: 2,
                    register: 10,
                    values: vec![1.0, 2.0, 3.0]
                },
                Command::MaskWrite {
                    slave: 1,
                    register: 0,
                    and_mask: 0xFF00,
                    or_mask: 0x0012
                },
                Command::WriteCoils {
                    slave: 1,
                    register: 3,
                    values: vec![true, false, true]
                },
            ]
        );
    }

    #[test]
    fn test_s7_and_ui_calls() {
        let commands = parse_commands(
            "setDBint(3,8,-12);setDBbool(3,0,7,1);slider(2,65);popup(Drop soon, check colour);sleep(1.5)",
        )
        .unwrap();
        assert_eq!(
            commands,
            vec![
                Command::SetDbInt {
                    db: 3,
                    start: 8,
                    value: -12
                },
                Command::SetDbBool {
                    db: 3,
                    start: 0,
                    bit: 7,
                    value: true
                },
                Command::Slider {
                    slider: 2,
                    value: 65.0
                },
                Command::PopUp("Drop soon, check colour".to_string()),
                Command::Sleep(1.5),
            ]
        );
    }

    #[test]
    fn test_bad_commands() {
        assert!(parse_commands("write(1,4)").is_err());
        assert!(parse_commands("write(300,4,1)").is_err());
        assert!(parse_commands("write(1,4,1.5.2)").is_err());
        assert!(parse_commands("setDBbool(1,0,8,1)").is_err());
        assert!(parse_commands("slider(5,10)").is_err());
        assert!(parse_commands("launch(rockets)").is_err());
        assert!(parse_commands("PREHEAT").is_err());
        assert!(parse_commands("write(1,4,1").is_err());
    }

    #[test]
    fn test_value_placeholder() {
        // Slider at 40 scaled by 10 with offset 5
        let bindings = Bindings::value(40.0, 10.0, 5.0);
        assert_eq!(substitute("write(1,2,{})", &bindings).unwrap(), "write(1,2,405)");
        assert_eq!(
            parse_with("setSV({})", &Bindings::value(2.5, 1.0, 0.0)).unwrap(),
            vec![Command::SetSv(2.5)]
        );
    }

    #[test]
    fn test_reading_placeholders() {
        let bindings = Bindings {
            et: Some(231.5),
            bt: Some(187.25),
            time: Some(420.0),
            ..Bindings::default()
        };
        assert_eq!(
            substitute("popup(ET {ET} BT {BT} at {time})", &bindings).unwrap(),
            "popup(ET 231.5 BT 187.25 at 420)"
        );
        assert!(matches!(
            substitute("{ETB}", &bindings),
            Err(AlarmError::UnboundPlaceholder(_))
        ));
        assert!(substitute("{DT}", &bindings).is_err());
        assert!(substitute("write(1,1,{", &bindings).is_err());
    }
}
