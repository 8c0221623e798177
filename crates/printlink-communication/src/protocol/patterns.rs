//! Wire patterns recognised on the printer's output
//!
//! Every pattern is compiled once and shared. Routing entries are keyed by
//! the pattern text, so registering the same `&'static Regex` from two
//! places merges into one entry.

use regex::Regex;
use std::sync::OnceLock;

macro_rules! wire_pattern {
    ($(#[$meta:meta])* $name:ident, $source:expr) => {
        $(#[$meta])*
        pub fn $name() -> &'static Regex {
            static PATTERN: OnceLock<Regex> = OnceLock::new();
            PATTERN.get_or_init(|| Regex::new($source).expect("invalid regex pattern"))
        }
    };
}

wire_pattern!(
    /// Acknowledgement, optionally followed by glued-on output in `extra`
    confirmation,
    r"^ok(?:\s(?P<extra>.*))?$"
);

wire_pattern!(
    /// Resend request carrying the first discarded line number
    resend,
    r"^Resend: ?(?P<cmd_number>\d+)$"
);

wire_pattern!(
    /// Printed once by the firmware after a reset
    printer_boot,
    r"^start$"
);

wire_pattern!(
    /// The firmware threw away its receive buffer
    rx_discarded,
    r"^echo:Now fresh file: .*$"
);

wire_pattern!(
    /// Keep-alive while a long command runs
    busy,
    r"^echo:busy: processing$"
);

wire_pattern!(
    /// The firmware waits for the user
    attention,
    r"^echo:busy: paused for user$"
);

wire_pattern!(
    /// Host action: print paused
    paused,
    r"^// action:paused$"
);

wire_pattern!(
    /// Host action: print resumed
    resumed,
    r"^// action:resumed$"
);

wire_pattern!(
    /// Host action: print cancelled
    cancel,
    r"^// action:cancel$"
);

wire_pattern!(
    /// SD print started
    print_start,
    r#"^echo:enqueing "M24"$"#
);

wire_pattern!(
    /// SD print done
    print_done,
    r"^Done printing file$"
);

wire_pattern!(
    /// Fatal firmware error
    error,
    r"^Error:(Printer halted\. kill\(\) called!|Printer stopped due to errors\..*)"
);

wire_pattern!(
    /// Fan failure, announcing the following attention state
    fan_error,
    r"^(?P<fan_name>Extruder|Print) fan speed is lower than expected$"
);

wire_pattern!(
    /// Heating progress with the bed
    heating,
    r"^T:\d+\.\d+ E:\d+ B:\d+\.\d+$"
);

wire_pattern!(
    /// Heating progress of the hotend alone
    heating_hotend,
    r"^T:\d+\.\d+ E:([?]|\d+) W:([?]|\d+)$"
);

wire_pattern!(
    /// Temperature report, also found glued to an acknowledgement
    temperature,
    r"^T:(?P<ntemp>-?\d+\.\d+) /(?P<set_ntemp>-?\d+\.\d+) B:(?P<btemp>-?\d+\.\d+) /(?P<set_btemp>-?\d+\.\d+).*$"
);

wire_pattern!(
    /// Answer to the `M27` print progress query
    sd_print_status,
    r"^(?:SD printing byte (?P<sdn>\d+)/(?P<sdt>\d+)|Not SD printing)$"
);

wire_pattern!(
    /// Line number reset, with or without its own line number
    line_reset,
    r"^(N\d+)? *M110 N(?P<cmd_number>-?\d*)$"
);
