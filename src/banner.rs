/// Printed at startup when stdout is a terminal.
pub const BANNER: &str = r"
          _                  _
      ___| |__      __ _ | |_
     / __| '_ \    / _` || __|
    | (__| | | | _| (_| || |_
     \___|_| |_|(_)\__,_| \__|
";
