//! SCPI command interpretation for the simulated instrument.
//!
//! Dispatch is two-stage: a raw fragment parses into a typed [`Command`],
//! then the command executes against the register file. Matching is
//! case-insensitive and mirrors the card's accepted spellings, with exact
//! patterns tried before prefix patterns so `LIST:VOLT:POIN?` wins over
//! the `LIST:VOLT ` data form.
//!
//! Contract: queries produce exactly one response string (possibly empty),
//! commands never produce one. Unrecognized input enqueues `-100` and
//! stays silent on the wire.

use crate::scpi::{
    self, Quantity, LIST_DWELL_MAX, LIST_DWELL_MIN, MAX_LIST_POINTS, MAX_SEQ_POINTS,
};
use crate::sim::device::{
    Device, ListDirection, ListGeneration, LogDirection, SourceMode, IDN, SCPI_VERSION,
};

/// One recognized SCPI command. List-bearing variants carry the raw
/// payload text because how much of it is accepted depends on the
/// remaining register capacity at execution time.
#[derive(Debug, PartialEq)]
pub(crate) enum Command<'a> {
    // IEEE 488.2 common commands
    Idn,
    Reset,
    ClearStatus,
    ReadEventStatus,
    ReadStatusByte,
    OpcQuery,
    SetOpc,
    Wait,
    Trigger,
    // SYSTem
    NextError,
    AllErrors,
    Version,
    // OUTPut
    Output(bool),
    OutputQuery,
    // FUNCtion
    SelectFunction(Quantity),
    FunctionQuery,
    // Setpoints and measurements
    SetLevel(Quantity, Option<f64>),
    LevelQuery(Quantity),
    Measure(Quantity),
    // Per-quantity mode and range
    ModeFix(Quantity),
    ModeList(Quantity),
    ModeQuery(Quantity),
    RangeAuto(Quantity, bool),
    RangeAutoQuery(Quantity),
    SetRange(Quantity, Option<i64>),
    RangeQuery(Quantity),
    // LIST subsystem
    ListClear,
    ListData(Quantity, &'a str),
    ListDataQuery(Quantity),
    ListPointsQuery(Quantity),
    ListDwell(&'a str),
    ListDwellQuery,
    ListDwellPointsQuery,
    ListCountSkip(Option<i64>),
    ListCountSkipQuery,
    ListCount(Option<i64>),
    ListCountQuery,
    ListDirection(ListDirection),
    ListDirectionQuery,
    ListGeneration(ListGeneration),
    ListGenerationQuery,
    ListSequence(&'a str),
    ListSequenceQuery,
    ListQueryPointer(Option<i64>),
    ListQueryPointerQuery,
    // STATus registers
    OperConditionQuery,
    OperEnableQuery,
    OperEnable(Option<i64>),
    OperEventQuery,
    QuesConditionQuery,
    QuesEnableQuery,
    QuesEnable(Option<i64>),
    QuesEventQuery,
    // Trigger subsystem stubs
    Initiate,
    Abort,
    InitContQuery,
    InitCont(bool),
}

/// Parse one trimmed fragment into a typed command.
///
/// `cmd` keeps its original casing so numeric payloads are extracted
/// verbatim; only the matching happens on the uppercased copy.
/// Truthy ON/OFF-style argument: anything containing `ON` or `1`, matching
/// the card's loose acceptance. Applied to the argument text only, so the
/// `CONT` in `INIT:CONT` cannot read as `ON`.
fn on_flag(arg: &str) -> bool {
    arg.contains("ON") || arg.contains('1')
}

pub(crate) fn parse(cmd: &str) -> Option<Command<'_>> {
    let upper = cmd.to_ascii_uppercase();
    let u = upper.as_str();

    // IEEE 488.2 common commands
    match u {
        "*IDN?" => return Some(Command::Idn),
        "*RST" => return Some(Command::Reset),
        "*CLS" => return Some(Command::ClearStatus),
        "*ESR?" => return Some(Command::ReadEventStatus),
        "*STB?" => return Some(Command::ReadStatusByte),
        "*OPC?" => return Some(Command::OpcQuery),
        "*OPC" => return Some(Command::SetOpc),
        "*WAI" => return Some(Command::Wait),
        _ => {}
    }

    // SYSTem
    match u {
        "SYST:ERR?" | "SYST:ERR:NEXT?" | "SYSTEM:ERROR?" | "SYSTEM:ERROR:NEXT?" => {
            return Some(Command::NextError)
        }
        "SYST:ERR:ALL?" | "SYSTEM:ERROR:ALL?" => return Some(Command::AllErrors),
        "SYST:VERS?" | "SYST:VERSION?" | "SYSTEM:VERSION?" => return Some(Command::Version),
        _ => {}
    }

    // OUTPut
    match u {
        "OUTP ON" | "OUTP 1" | "OUTPUT ON" | "OUTPUT 1" | "OUTP:STAT ON" | "OUTP:STAT 1" => {
            return Some(Command::Output(true))
        }
        "OUTP OFF" | "OUTP 0" | "OUTPUT OFF" | "OUTPUT 0" | "OUTP:STAT OFF" | "OUTP:STAT 0" => {
            return Some(Command::Output(false))
        }
        "OUTP?" | "OUTPUT?" | "OUTP:STAT?" => return Some(Command::OutputQuery),
        _ => {}
    }

    // FUNCtion:MODE
    match u {
        "FUNC:MODE VOLT" | "FUNCTION:MODE VOLT" => {
            return Some(Command::SelectFunction(Quantity::Volt))
        }
        "FUNC:MODE CURR" | "FUNCTION:MODE CURR" => {
            return Some(Command::SelectFunction(Quantity::Curr))
        }
        "FUNC:MODE?" | "FUNCTION:MODE?" => return Some(Command::FunctionQuery),
        _ => {}
    }

    // Bare setpoints: `VOLT <n>` / `CURR <n>` with no subsystem colon.
    if u.starts_with("VOLT ") && !u.contains(':') {
        return Some(Command::SetLevel(Quantity::Volt, scpi::parse_float(cmd, 5)));
    }
    if u == "VOLT?" {
        return Some(Command::LevelQuery(Quantity::Volt));
    }
    if u.starts_with("CURR ") && !u.contains(':') {
        return Some(Command::SetLevel(Quantity::Curr, scpi::parse_float(cmd, 5)));
    }
    if u == "CURR?" {
        return Some(Command::LevelQuery(Quantity::Curr));
    }

    // MEASure
    match u {
        "MEAS:VOLT?" | "MEAS:SCAL:VOLT?" | "MEASURE:VOLTAGE?" | "MEASURE:SCALAR:VOLTAGE?"
        | "MEAS:VOLT:DC?" | "MEAS:SCAL:VOLT:DC?" => return Some(Command::Measure(Quantity::Volt)),
        "MEAS:CURR?" | "MEAS:SCAL:CURR?" | "MEASURE:CURRENT?" | "MEASURE:SCALAR:CURRENT?"
        | "MEAS:CURR:DC?" | "MEAS:SCAL:CURR:DC?" => return Some(Command::Measure(Quantity::Curr)),
        _ => {}
    }

    // VOLT:MODE / CURR:MODE
    match u {
        "VOLT:MODE FIX" | "VOLT:MODE FIXED" => return Some(Command::ModeFix(Quantity::Volt)),
        "VOLT:MODE LIST" => return Some(Command::ModeList(Quantity::Volt)),
        "VOLT:MODE?" => return Some(Command::ModeQuery(Quantity::Volt)),
        "CURR:MODE FIX" | "CURR:MODE FIXED" => return Some(Command::ModeFix(Quantity::Curr)),
        "CURR:MODE LIST" => return Some(Command::ModeList(Quantity::Curr)),
        "CURR:MODE?" => return Some(Command::ModeQuery(Quantity::Curr)),
        _ => {}
    }

    // VOLT:RANG / CURR:RANG (the `:AUTO` forms shadow the bare prefix)
    for (quantity, root) in [(Quantity::Volt, "VOLT"), (Quantity::Curr, "CURR")] {
        if u == format!("{root}:RANG:AUTO?") {
            return Some(Command::RangeAutoQuery(quantity));
        }
        if u.starts_with(&format!("{root}:RANG:AUTO")) {
            return Some(Command::RangeAuto(quantity, on_flag(&u[14..])));
        }
        if u.starts_with(&format!("{root}:RANG ")) {
            return Some(Command::SetRange(quantity, scpi::parse_int(cmd, 10)));
        }
        if u == format!("{root}:RANG?") {
            return Some(Command::RangeQuery(quantity));
        }
    }

    // LIST subsystem
    match u {
        "LIST:CLE" | "LIST:CLEAR" => return Some(Command::ListClear),
        "LIST:VOLT?" | "LIST:VOLTAGE?" => return Some(Command::ListDataQuery(Quantity::Volt)),
        "LIST:VOLT:POIN?" | "LIST:VOLT:POINTS?" | "LIST:VOLTAGE:POINTS?" => {
            return Some(Command::ListPointsQuery(Quantity::Volt))
        }
        "LIST:CURR?" | "LIST:CURRENT?" => return Some(Command::ListDataQuery(Quantity::Curr)),
        "LIST:CURR:POIN?" | "LIST:CURR:POINTS?" | "LIST:CURRENT:POINTS?" => {
            return Some(Command::ListPointsQuery(Quantity::Curr))
        }
        "LIST:DWEL?" | "LIST:DWELL?" => return Some(Command::ListDwellQuery),
        "LIST:DWEL:POIN?" | "LIST:DWELL:POINTS?" => return Some(Command::ListDwellPointsQuery),
        "LIST:COUN:SKIP?" | "LIST:COUNT:SKIP?" => return Some(Command::ListCountSkipQuery),
        "LIST:COUN?" | "LIST:COUNT?" => return Some(Command::ListCountQuery),
        "LIST:DIR UP" | "LIST:DIRECTION UP" => {
            return Some(Command::ListDirection(ListDirection::Up))
        }
        "LIST:DIR DOWN" | "LIST:DIRECTION DOWN" => {
            return Some(Command::ListDirection(ListDirection::Down))
        }
        "LIST:DIR?" | "LIST:DIRECTION?" => return Some(Command::ListDirectionQuery),
        "LIST:GEN DSEQ" | "LIST:GEN DSEQUENCE" | "LIST:GENERATION DSEQ"
        | "LIST:GENERATION DSEQUENCE" => {
            return Some(Command::ListGeneration(ListGeneration::Dseq))
        }
        "LIST:GEN SEQ" | "LIST:GEN SEQUENCE" | "LIST:GENERATION SEQ"
        | "LIST:GENERATION SEQUENCE" => return Some(Command::ListGeneration(ListGeneration::Seq)),
        "LIST:GEN?" | "LIST:GENERATION?" => return Some(Command::ListGenerationQuery),
        "LIST:SEQ?" | "LIST:SEQUENCE?" => return Some(Command::ListSequenceQuery),
        "LIST:QUER?" | "LIST:QUERY?" => return Some(Command::ListQueryPointerQuery),
        _ => {}
    }
    if u.starts_with("LIST:VOLT ") && !u.contains("POIN") {
        return Some(Command::ListData(Quantity::Volt, &cmd[10..]));
    }
    if u.starts_with("LIST:CURR ") && !u.contains("POIN") {
        return Some(Command::ListData(Quantity::Curr, &cmd[10..]));
    }
    if u.starts_with("LIST:DWEL ") && !u.contains("POIN") {
        return Some(Command::ListDwell(&cmd[10..]));
    }
    if u.starts_with("LIST:COUN:SKIP ") {
        return Some(Command::ListCountSkip(scpi::parse_int(cmd, 15)));
    }
    if u.starts_with("LIST:COUN ") {
        return Some(Command::ListCount(scpi::parse_int(cmd, 10)));
    }
    if u.starts_with("LIST:SEQ ") && !u.contains('?') {
        return Some(Command::ListSequence(&cmd[9..]));
    }
    if u.starts_with("LIST:QUER ") && !u.contains('?') {
        return Some(Command::ListQueryPointer(scpi::parse_int(cmd, 10)));
    }

    // STATus registers
    match u {
        "STAT:OPER:COND?" | "STATUS:OPERATION:CONDITION?" => {
            return Some(Command::OperConditionQuery)
        }
        "STAT:OPER:ENAB?" | "STATUS:OPERATION:ENABLE?" => return Some(Command::OperEnableQuery),
        "STAT:OPER?" | "STATUS:OPERATION?" => return Some(Command::OperEventQuery),
        "STAT:QUES:COND?" | "STATUS:QUESTIONABLE:CONDITION?" => {
            return Some(Command::QuesConditionQuery)
        }
        "STAT:QUES:ENAB?" | "STATUS:QUESTIONABLE:ENABLE?" => return Some(Command::QuesEnableQuery),
        "STAT:QUES?" | "STATUS:QUESTIONABLE?" => return Some(Command::QuesEventQuery),
        _ => {}
    }
    if u.starts_with("STAT:OPER:ENAB") {
        return Some(Command::OperEnable(scpi::parse_int(cmd, 15)));
    }
    if u.starts_with("STAT:QUES:ENAB") {
        return Some(Command::QuesEnable(scpi::parse_int(cmd, 15)));
    }

    // INITiate / ABORt / TRIGger stubs
    match u {
        "INIT" | "INIT:IMM" | "INITIATE:IMMEDIATE" => return Some(Command::Initiate),
        "ABOR" | "ABORT" => return Some(Command::Abort),
        "INIT:CONT?" | "INITIATE:CONTINUOUS?" => return Some(Command::InitContQuery),
        "*TRG" | "TRIG" | "TRIGGER" => return Some(Command::Trigger),
        _ => {}
    }
    if u.starts_with("INIT:CONT") {
        return Some(Command::InitCont(on_flag(&u[9..])));
    }

    None
}

impl Device {
    /// Process one raw SCPI line, possibly compound. Returns the joined
    /// response text when any fragment was a query, `None` otherwise.
    pub fn process(&self, raw: &str) -> Option<String> {
        let mut responses = Vec::new();
        for fragment in scpi::split_commands(raw) {
            if let Some(response) = self.dispatch(fragment) {
                responses.push(response);
            }
        }
        self.notify();
        if responses.is_empty() {
            None
        } else {
            Some(responses.join(";"))
        }
    }

    fn dispatch(&self, fragment: &str) -> Option<String> {
        self.log(LogDirection::Rx, fragment);
        self.with_regs(|regs| regs.cmd_count += 1);

        let Some(command) = parse(fragment) else {
            self.push_error(-100, format!("Command error; unrecognised: {fragment}"));
            return None;
        };
        self.execute(command)
    }

    /// Count and log a query response.
    fn reply(&self, value: String) -> Option<String> {
        self.with_regs(|regs| regs.query_count += 1);
        self.log(LogDirection::Tx, &value);
        Some(value)
    }

    fn execute(&self, command: Command<'_>) -> Option<String> {
        match command {
            Command::Idn => self.reply(IDN.to_string()),
            Command::Reset => {
                self.reset();
                None
            }
            Command::ClearStatus => {
                self.with_regs(|regs| {
                    regs.esr = 0;
                    regs.stb = 0;
                    regs.oper_event = 0;
                    regs.ques_event = 0;
                    regs.error_queue.clear();
                });
                None
            }
            Command::ReadEventStatus => {
                let value = self.with_regs(|regs| std::mem::take(&mut regs.esr));
                self.reply(value.to_string())
            }
            Command::ReadStatusByte => {
                let value = self.with_regs(|regs| regs.stb);
                self.reply(value.to_string())
            }
            Command::OpcQuery => self.reply("1".to_string()),
            Command::SetOpc => {
                self.with_regs(|regs| regs.esr |= 1);
                None
            }
            Command::Wait | Command::Initiate | Command::Trigger => None,

            Command::NextError => {
                let (code, message) = self.pop_error();
                self.reply(format!("{code},\"{message}\""))
            }
            Command::AllErrors => {
                let mut entries = Vec::new();
                loop {
                    let (code, message) = self.pop_error();
                    entries.push(format!("{code},\"{message}\""));
                    if code == 0 {
                        break;
                    }
                }
                self.reply(entries.join(";"))
            }
            Command::Version => self.reply(SCPI_VERSION.to_string()),

            Command::Output(true) => {
                self.with_regs(|regs| {
                    regs.output_on = true;
                    regs.volt_setpoint = regs.volt_saved;
                    regs.curr_setpoint = regs.curr_saved;
                });
                None
            }
            Command::Output(false) => {
                self.with_regs(|regs| {
                    regs.volt_saved = regs.volt_setpoint;
                    regs.curr_saved = regs.curr_setpoint;
                    regs.output_on = false;
                    regs.volt_setpoint = 0.0;
                    regs.curr_setpoint = 0.0;
                });
                None
            }
            Command::OutputQuery => {
                let on = self.with_regs(|regs| regs.output_on);
                self.reply(if on { "1" } else { "0" }.to_string())
            }

            Command::SelectFunction(quantity) => {
                self.with_regs(|regs| {
                    regs.func_mode = quantity;
                    regs.volt_mode = SourceMode::Fix;
                    regs.curr_mode = SourceMode::Fix;
                });
                None
            }
            Command::FunctionQuery => {
                let mode = self.with_regs(|regs| regs.func_mode);
                self.reply(mode.mnemonic().to_string())
            }

            Command::SetLevel(quantity, value) => {
                if let Some(value) = value {
                    self.with_regs(|regs| {
                        let (setpoint, saved) = match quantity {
                            Quantity::Volt => (&mut regs.volt_setpoint, &mut regs.volt_saved),
                            Quantity::Curr => (&mut regs.curr_setpoint, &mut regs.curr_saved),
                        };
                        *setpoint = value;
                        if regs.output_on {
                            *saved = value;
                        }
                    });
                }
                None
            }
            Command::LevelQuery(quantity) => {
                let value = self.with_regs(|regs| match quantity {
                    Quantity::Volt => regs.volt_setpoint,
                    Quantity::Curr => regs.curr_setpoint,
                });
                self.reply(scpi::format_sci(value))
            }
            Command::Measure(quantity) => {
                let value = self.measure(quantity);
                self.reply(scpi::format_sci(value))
            }

            Command::ModeFix(quantity) => {
                self.stop_list();
                self.with_regs(|regs| match quantity {
                    Quantity::Volt => regs.volt_mode = SourceMode::Fix,
                    Quantity::Curr => regs.curr_mode = SourceMode::Fix,
                });
                None
            }
            Command::ModeList(quantity) => {
                self.with_regs(|regs| match quantity {
                    Quantity::Volt => regs.volt_mode = SourceMode::List,
                    Quantity::Curr => regs.curr_mode = SourceMode::List,
                });
                self.start_list();
                None
            }
            Command::ModeQuery(quantity) => {
                let mode = self.with_regs(|regs| match quantity {
                    Quantity::Volt => regs.volt_mode,
                    Quantity::Curr => regs.curr_mode,
                });
                self.reply(mode.mnemonic().to_string())
            }

            Command::RangeAuto(quantity, on) => {
                self.with_regs(|regs| match quantity {
                    Quantity::Volt => regs.volt_range_auto = on,
                    Quantity::Curr => regs.curr_range_auto = on,
                });
                None
            }
            Command::RangeAutoQuery(quantity) => {
                let auto = self.with_regs(|regs| match quantity {
                    Quantity::Volt => regs.volt_range_auto,
                    Quantity::Curr => regs.curr_range_auto,
                });
                self.reply(if auto { "1" } else { "0" }.to_string())
            }
            Command::SetRange(quantity, value) => {
                if let Some(value) = value {
                    self.with_regs(|regs| match quantity {
                        Quantity::Volt => regs.volt_range = value,
                        Quantity::Curr => regs.curr_range = value,
                    });
                }
                None
            }
            Command::RangeQuery(quantity) => {
                let range = self.with_regs(|regs| match quantity {
                    Quantity::Volt => regs.volt_range,
                    Quantity::Curr => regs.curr_range,
                });
                self.reply(range.to_string())
            }

            Command::ListClear => {
                self.with_regs(|regs| {
                    regs.list_volt.clear();
                    regs.list_curr.clear();
                    regs.list_dwell.clear();
                    regs.list_sequence.clear();
                    regs.list_count = 1;
                    regs.list_count_skip = 0;
                    regs.list_direction = ListDirection::Up;
                    regs.list_generation = ListGeneration::Dseq;
                    regs.list_query_ptr = 0;
                });
                None
            }
            Command::ListData(quantity, payload) => {
                let (conflict, space) = self.with_regs(|regs| match quantity {
                    Quantity::Volt => (
                        !regs.list_curr.is_empty(),
                        MAX_LIST_POINTS.saturating_sub(regs.list_volt.len()),
                    ),
                    Quantity::Curr => (
                        !regs.list_volt.is_empty(),
                        MAX_LIST_POINTS.saturating_sub(regs.list_curr.len()),
                    ),
                });
                if conflict {
                    self.push_error(-221, "Settings conflict");
                    return None;
                }
                if space == 0 {
                    return None;
                }
                let values = scpi::parse_float_list(payload, 0, space);
                self.with_regs(|regs| {
                    let list = match quantity {
                        Quantity::Volt => &mut regs.list_volt,
                        Quantity::Curr => &mut regs.list_curr,
                    };
                    list.extend(values.into_iter().take(space));
                });
                None
            }
            Command::ListDataQuery(quantity) => {
                let chunk = self.with_regs(|regs| {
                    let list = match quantity {
                        Quantity::Volt => &regs.list_volt,
                        Quantity::Curr => &regs.list_curr,
                    };
                    paged_window(list, regs.list_query_ptr).to_vec()
                });
                self.reply(join_formatted(&chunk))
            }
            Command::ListPointsQuery(quantity) => {
                let count = self.with_regs(|regs| match quantity {
                    Quantity::Volt => regs.list_volt.len(),
                    Quantity::Curr => regs.list_curr.len(),
                });
                self.reply(count.to_string())
            }

            Command::ListDwell(payload) => {
                let space =
                    self.with_regs(|regs| MAX_LIST_POINTS.saturating_sub(regs.list_dwell.len()));
                if space == 0 {
                    return None;
                }
                let values = scpi::parse_float_list(payload, 0, space);
                if values
                    .iter()
                    .any(|&v| !(LIST_DWELL_MIN..=LIST_DWELL_MAX).contains(&v))
                {
                    self.push_error(
                        -222,
                        format!(
                            "Data out of range; dwell must be {LIST_DWELL_MIN}..{LIST_DWELL_MAX} s"
                        ),
                    );
                }
                self.with_regs(|regs| {
                    regs.list_dwell.extend(
                        values
                            .into_iter()
                            .map(|v| v.clamp(LIST_DWELL_MIN, LIST_DWELL_MAX))
                            .take(space),
                    );
                });
                None
            }
            Command::ListDwellQuery => {
                let chunk = self
                    .with_regs(|regs| paged_window(&regs.list_dwell, regs.list_query_ptr).to_vec());
                self.reply(join_formatted(&chunk))
            }
            Command::ListDwellPointsQuery => {
                let count = self.with_regs(|regs| regs.list_dwell.len());
                self.reply(count.to_string())
            }

            Command::ListCountSkip(value) => {
                if let Some(value) = value {
                    self.with_regs(|regs| regs.list_count_skip = value);
                }
                None
            }
            Command::ListCountSkipQuery => {
                let skip = self.with_regs(|regs| regs.list_count_skip);
                self.reply(skip.to_string())
            }
            Command::ListCount(value) => {
                if let Some(value) = value {
                    self.with_regs(|regs| regs.list_count = value);
                }
                None
            }
            Command::ListCountQuery => {
                let count = self.with_regs(|regs| regs.list_count);
                self.reply(count.to_string())
            }

            Command::ListDirection(direction) => {
                self.with_regs(|regs| regs.list_direction = direction);
                None
            }
            Command::ListDirectionQuery => {
                let direction = self.with_regs(|regs| regs.list_direction);
                self.reply(direction.mnemonic().to_string())
            }
            Command::ListGeneration(generation) => {
                self.with_regs(|regs| regs.list_generation = generation);
                None
            }
            Command::ListGenerationQuery => {
                // The card refuses to report the generation mode mid-run.
                if self.with_regs(|regs| regs.list_running) {
                    self.push_error(-221, "Settings conflict; list running");
                    return None;
                }
                let generation = self.with_regs(|regs| regs.list_generation);
                self.reply(generation.mnemonic().to_string())
            }

            Command::ListSequence(payload) => {
                let space =
                    self.with_regs(|regs| MAX_SEQ_POINTS.saturating_sub(regs.list_sequence.len()));
                if space == 0 {
                    return None;
                }
                let values = scpi::parse_int_list(payload, 0, space);
                self.with_regs(|regs| {
                    regs.list_sequence.extend(values.into_iter().take(space));
                });
                None
            }
            Command::ListSequenceQuery => {
                let chunk = self.with_regs(|regs| {
                    paged_window(&regs.list_sequence, regs.list_query_ptr).to_vec()
                });
                let joined = chunk
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                self.reply(joined)
            }

            Command::ListQueryPointer(value) => {
                if let Some(value) = value {
                    self.with_regs(|regs| regs.list_query_ptr = value.max(0) as usize);
                }
                None
            }
            Command::ListQueryPointerQuery => {
                let pointer = self.with_regs(|regs| regs.list_query_ptr);
                self.reply(pointer.to_string())
            }

            Command::OperConditionQuery => {
                let value = self.with_regs(|regs| regs.oper_cond);
                self.reply(value.to_string())
            }
            Command::OperEnableQuery => {
                let value = self.with_regs(|regs| regs.oper_enable);
                self.reply(value.to_string())
            }
            Command::OperEnable(value) => {
                if let Some(value) = value {
                    self.with_regs(|regs| regs.oper_enable = value);
                }
                None
            }
            Command::OperEventQuery => {
                let value = self.with_regs(|regs| std::mem::take(&mut regs.oper_event));
                self.reply(value.to_string())
            }
            Command::QuesConditionQuery => {
                let value = self.with_regs(|regs| regs.ques_cond);
                self.reply(value.to_string())
            }
            Command::QuesEnableQuery => {
                let value = self.with_regs(|regs| regs.ques_enable);
                self.reply(value.to_string())
            }
            Command::QuesEnable(value) => {
                if let Some(value) = value {
                    self.with_regs(|regs| regs.ques_enable = value);
                }
                None
            }
            Command::QuesEventQuery => {
                let value = self.with_regs(|regs| std::mem::take(&mut regs.ques_event));
                self.reply(value.to_string())
            }

            Command::Abort => {
                self.stop_list();
                None
            }
            Command::InitContQuery => {
                let cont = self.with_regs(|regs| regs.init_cont);
                self.reply(if cont { "1" } else { "0" }.to_string())
            }
            Command::InitCont(on) => {
                self.with_regs(|regs| regs.init_cont = on);
                None
            }
        }
    }
}

/// 16-item query window starting at the read cursor. A cursor past the
/// end yields an empty window, not an error.
fn paged_window<T>(items: &[T], pointer: usize) -> &[T] {
    let start = pointer.min(items.len());
    let end = (start + 16).min(items.len());
    &items[start..end]
}

fn join_formatted(values: &[f64]) -> String {
    values
        .iter()
        .map(|&v| scpi::format_sci(v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new()
    }

    #[test]
    fn identity_and_version() {
        let device = device();
        assert_eq!(device.process("*IDN?"), Some(IDN.to_string()));
        assert_eq!(device.process("SYST:VERS?"), Some("1995.0".to_string()));
    }

    #[test]
    fn setpoint_query_uses_scientific_notation() {
        let device = device();
        assert_eq!(device.process("VOLT 5.0"), None);
        assert_eq!(device.process("VOLT?"), Some("5.000000E+00".to_string()));
        assert_eq!(device.process("curr 0.25"), None);
        assert_eq!(device.process("CURR?"), Some("2.500000E-01".to_string()));
    }

    #[test]
    fn output_off_zeroes_and_on_restores_setpoints() {
        let device = device();
        device.process("VOLT 5.5");
        device.process("CURR 1.25");
        device.process("OUTP OFF");
        assert_eq!(device.process("VOLT?"), Some("0.000000E+00".to_string()));
        assert_eq!(device.process("CURR?"), Some("0.000000E+00".to_string()));
        device.process("OUTP ON");
        assert_eq!(device.process("VOLT?"), Some("5.500000E+00".to_string()));
        assert_eq!(device.process("CURR?"), Some("1.250000E+00".to_string()));
        assert_eq!(device.process("OUTP?"), Some("1".to_string()));
    }

    #[test]
    fn measurement_follows_output_state() {
        let device = device();
        device.process("VOLT 3.0");
        let off = device.process("MEAS:VOLT?").unwrap();
        assert_eq!(off, "0.000000E+00");
        device.process("OUTP ON");
        let on: f64 = device.process("MEAS:VOLT?").unwrap().parse().unwrap();
        assert!((on - 3.0).abs() <= 0.0021, "measured {on}");
    }

    #[test]
    fn compound_commands_join_responses() {
        let device = device();
        let response = device.process("VOLT 2.0;:VOLT?;OUTP?").unwrap();
        assert_eq!(response, "2.000000E+00;0");
    }

    #[test]
    fn unknown_command_is_silent_and_queued() {
        let device = device();
        assert_eq!(device.process("FOO:BAR"), None);
        let regs = device.snapshot();
        assert_eq!(regs.error_queue.len(), 1);
        assert_eq!(regs.error_queue[0].0, -100);
        assert_eq!(
            device.process("SYST:ERR?"),
            Some("-100,\"Command error; unrecognised: FOO:BAR\"".to_string())
        );
    }

    #[test]
    fn error_queue_drains_to_sentinel() {
        let device = device();
        device.process("FOO");
        device.process("BAR");
        assert!(device.process("SYST:ERR?").unwrap().starts_with("-100"));
        assert!(device.process("SYST:ERR?").unwrap().starts_with("-100"));
        assert_eq!(
            device.process("SYST:ERR?"),
            Some("0,\"No error\"".to_string())
        );
        assert_eq!(
            device.process("SYST:ERR?"),
            Some("0,\"No error\"".to_string())
        );
    }

    #[test]
    fn drain_all_reports_everything_and_ends_with_sentinel() {
        let device = device();
        device.process("FOO");
        let all = device.process("SYST:ERR:ALL?").unwrap();
        assert!(all.starts_with("-100,"));
        assert!(all.ends_with("0,\"No error\""));
    }

    #[test]
    fn esr_clears_on_read() {
        let device = device();
        device.process("*OPC");
        assert_eq!(device.process("*ESR?"), Some("1".to_string()));
        assert_eq!(device.process("*ESR?"), Some("0".to_string()));
    }

    #[test]
    fn cls_clears_status_and_errors() {
        let device = device();
        device.process("*OPC");
        device.process("FOO");
        device.process("*CLS");
        let regs = device.snapshot();
        assert_eq!(regs.esr, 0);
        assert!(regs.error_queue.is_empty());
    }

    #[test]
    fn status_event_registers_clear_on_read() {
        let device = device();
        device.with_regs(|r| {
            r.oper_event = 9;
            r.ques_event = 5;
        });
        assert_eq!(device.process("STAT:OPER?"), Some("9".to_string()));
        assert_eq!(device.process("STAT:OPER?"), Some("0".to_string()));
        assert_eq!(device.process("STAT:QUES?"), Some("5".to_string()));
        assert_eq!(device.process("STAT:QUES?"), Some("0".to_string()));
    }

    #[test]
    fn enable_registers_are_read_write() {
        let device = device();
        device.process("STAT:OPER:ENAB 12");
        assert_eq!(device.process("STAT:OPER:ENAB?"), Some("12".to_string()));
        device.process("STAT:QUES:ENAB 3");
        assert_eq!(device.process("STAT:QUES:ENAB?"), Some("3".to_string()));
    }

    #[test]
    fn list_clear_resets_the_subsystem() {
        let device = device();
        device.process("LIST:VOLT 1,2,3");
        device.process("LIST:DWEL 0.01");
        device.process("LIST:COUN 5");
        device.process("LIST:DIR DOWN");
        device.process("LIST:CLE");
        assert_eq!(device.process("LIST:VOLT:POIN?"), Some("0".to_string()));
        assert_eq!(device.process("LIST:CURR:POIN?"), Some("0".to_string()));
        assert_eq!(device.process("LIST:DWEL:POIN?"), Some("0".to_string()));
        assert_eq!(device.process("LIST:COUN?"), Some("1".to_string()));
        assert_eq!(device.process("LIST:DIR?"), Some("UP".to_string()));
    }

    #[test]
    fn list_data_accumulates_across_commands() {
        let device = device();
        device.process("LIST:VOLT 1,2,3");
        device.process("LIST:VOLT 4,5");
        assert_eq!(device.process("LIST:VOLT:POIN?"), Some("5".to_string()));
    }

    #[test]
    fn mixing_volt_and_curr_lists_is_a_conflict() {
        let device = device();
        device.process("LIST:VOLT 1,2");
        device.process("LIST:CURR 3,4");
        assert_eq!(device.process("LIST:CURR:POIN?"), Some("0".to_string()));
        assert!(device.process("SYST:ERR?").unwrap().starts_with("-221"));
    }

    #[test]
    fn out_of_range_dwell_is_clamped_and_reported() {
        let device = device();
        device.process("LIST:DWEL 0.00001,5.0,20.0");
        assert!(device.process("SYST:ERR?").unwrap().starts_with("-222"));
        let dwells = device.snapshot().list_dwell;
        assert_eq!(dwells, vec![LIST_DWELL_MIN, 5.0, LIST_DWELL_MAX]);
    }

    #[test]
    fn list_queries_are_paginated_by_the_read_cursor() {
        let device = device();
        let values: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        device.process(&format!("LIST:VOLT {}", values.join(",")));

        let first = device.process("LIST:VOLT?").unwrap();
        assert_eq!(first.split(',').count(), 16);
        assert!(first.starts_with("0.000000E+00"));

        device.process("LIST:QUER 16");
        assert_eq!(device.process("LIST:QUER?"), Some("16".to_string()));
        let second = device.process("LIST:VOLT?").unwrap();
        assert_eq!(second.split(',').count(), 4);

        // Past the end: empty string, not an error.
        device.process("LIST:QUER 100");
        assert_eq!(device.process("LIST:VOLT?"), Some(String::new()));
        assert_eq!(device.process("SYST:ERR?"), Some("0,\"No error\"".to_string()));
    }

    #[test]
    fn list_sequence_renders_as_decimal() {
        let device = device();
        device.process("LIST:SEQ 3,1,2");
        assert_eq!(device.process("LIST:SEQ?"), Some("3,1,2".to_string()));
    }

    #[test]
    fn generation_query_conflicts_while_running() {
        let device = device();
        device.with_regs(|r| r.list_running = true);
        assert_eq!(device.process("LIST:GEN?"), None);
        assert!(device.process("SYST:ERR?").unwrap().starts_with("-221"));
        device.with_regs(|r| r.list_running = false);
        assert_eq!(device.process("LIST:GEN?"), Some("DSEQ".to_string()));
    }

    #[test]
    fn range_commands_roundtrip() {
        let device = device();
        device.process("VOLT:RANG 0");
        assert_eq!(device.process("VOLT:RANG?"), Some("0".to_string()));
        device.process("VOLT:RANG:AUTO OFF");
        assert_eq!(device.process("VOLT:RANG:AUTO?"), Some("0".to_string()));
        device.process("CURR:RANG:AUTO 1");
        assert_eq!(device.process("CURR:RANG:AUTO?"), Some("1".to_string()));
    }

    #[test]
    fn function_mode_select_and_query() {
        let device = device();
        device.process("FUNC:MODE CURR");
        assert_eq!(device.process("FUNC:MODE?"), Some("CURR".to_string()));
    }

    #[test]
    fn init_cont_flag_roundtrip() {
        let device = device();
        assert_eq!(device.process("INIT:CONT?"), Some("1".to_string()));
        device.process("INIT:CONT OFF");
        assert_eq!(device.process("INIT:CONT?"), Some("0".to_string()));
    }

    #[test]
    fn malformed_setpoint_is_ignored() {
        let device = device();
        device.process("VOLT 1.5");
        device.process("VOLT abc");
        assert_eq!(device.process("VOLT?"), Some("1.500000E+00".to_string()));
        // Recognized command shape, so nothing is queued either.
        assert_eq!(device.process("SYST:ERR?"), Some("0,\"No error\"".to_string()));
    }

    #[test]
    fn counters_track_commands_and_queries() {
        let device = device();
        device.process("VOLT 1.0");
        device.process("VOLT?");
        device.process("FOO");
        let regs = device.snapshot();
        assert_eq!(regs.cmd_count, 3);
        assert_eq!(regs.query_count, 1);
    }

    #[test]
    fn rst_restores_power_on_state() {
        let device = device();
        device.process("VOLT 7.0");
        device.process("OUTP ON");
        device.process("LIST:VOLT 1,2,3");
        device.process("*RST");
        let regs = device.snapshot();
        assert!(!regs.output_on);
        assert_eq!(regs.volt_setpoint, 0.0);
        assert!(regs.list_volt.is_empty());
        assert_eq!(regs.cmd_count, 0);
    }

    #[test]
    fn rst_stops_a_running_list() {
        let device = device();
        device.process("LIST:VOLT 1,2,3,4");
        device.process("LIST:DWEL 0.1");
        device.process("LIST:COUN 0");
        device.process("VOLT:MODE LIST");
        assert!(device.snapshot().list_running);
        device.process("*RST");
        let regs = device.snapshot();
        assert!(!regs.list_running);
        assert!(regs.list_volt.is_empty());
    }

    #[test]
    fn abort_and_mode_fix_stop_a_running_list() {
        for stop_cmd in ["ABOR", "VOLT:MODE FIX"] {
            let device = device();
            device.process("LIST:VOLT 1,2,3,4");
            device.process("LIST:DWEL 0.1");
            device.process("LIST:COUN 0");
            device.process("VOLT:MODE LIST");
            assert!(device.snapshot().list_running, "list did not start");
            device.process(stop_cmd);
            let regs = device.snapshot();
            assert!(!regs.list_running, "{stop_cmd} did not stop the list");
            assert_eq!(regs.volt_mode, SourceMode::Fix);
        }
    }

    #[test]
    fn on_off_flags_read_the_argument_only() {
        assert_eq!(parse("INIT:CONT OFF"), Some(Command::InitCont(false)));
        assert_eq!(parse("INIT:CONT ON"), Some(Command::InitCont(true)));
        assert_eq!(parse("init:cont 1"), Some(Command::InitCont(true)));
        assert_eq!(
            parse("VOLT:RANG:AUTO OFF"),
            Some(Command::RangeAuto(Quantity::Volt, false))
        );
    }

    #[test]
    fn parse_prefers_exact_over_prefix_forms() {
        assert_eq!(
            parse("LIST:VOLT:POIN?"),
            Some(Command::ListPointsQuery(Quantity::Volt))
        );
        assert_eq!(
            parse("LIST:VOLT 1,2"),
            Some(Command::ListData(Quantity::Volt, "1,2"))
        );
        assert_eq!(parse("LIST:COUN:SKIP 2"), Some(Command::ListCountSkip(Some(2))));
        assert_eq!(parse("LIST:COUN 4"), Some(Command::ListCount(Some(4))));
        assert_eq!(parse("VOLT:RANG:AUTO?"), Some(Command::RangeAutoQuery(Quantity::Volt)));
        assert_eq!(parse("VOLT:RANG 1"), Some(Command::SetRange(Quantity::Volt, Some(1))));
        assert_eq!(parse("NOT:A:CMD"), None);
    }
}
