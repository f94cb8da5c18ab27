use std::ops::Range;

pub type Address = u16;
pub type Register = Range<Address>;

/// (year % 100, month), (day, hour), (minute, second), each packed as `256 * high + low`
pub const SYSTEM_TIME: Register = 0x0016..0x0019;
pub const DAILY_PRODUCTION: Register = 0x003C..0x003D;
pub const AC_VOLTAGE: Register = 0x0049..0x004A;
pub const GRID_CURRENT: Register = 0x004C..0x004D;
pub const TOTAL_AC_OUTPUT_POWER: Register = 0x0056..0x0058;

pub const DAILY_PRODUCTION_SCALE: f64 = 0.1;
pub const AC_VOLTAGE_SCALE: f64 = 0.1;
pub const GRID_CURRENT_SCALE: f64 = 0.1;
pub const TOTAL_AC_OUTPUT_POWER_SCALE: f64 = 0.1;

pub fn quantity(reg: &Register) -> u16 {
    reg.end - reg.start
}
