#![no_main]
use helios::modbus::Request;
use helios::modbus::solarman;
use helios::pipeline::decode::Encoding;
use libfuzzer_sys::fuzz_target;

const ENCODINGS: [&str; 17] = [
    "bool8", "int16", "int16nan", "uint16", "uint16nan", "int32", "int32s", "int32nan",
    "uint32", "uint32s", "uint32nan", "float32", "float32s", "uint64", "uint64nan",
    "float64", "ieee754",
];

fuzz_target!(|data: &[u8]| {
    // Register payloads of any length must decode or fail cleanly
    for name in ENCODINGS {
        if let Ok(encoding) = Encoding::parse(name, None) {
            let _ = encoding.decode(data);
        }
    }

    // Logger frames arrive from the network unvalidated
    if let Ok(rtu) = solarman::decode_frame(data) {
        let request = Request::ReadHoldingRegisters {
            address: 0,
            count: 2,
        };
        let _ = solarman::parse_rtu_response(1, &request, rtu);
    }
});
