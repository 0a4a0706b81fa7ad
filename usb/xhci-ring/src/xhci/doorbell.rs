/// Value written to the host doorbell to start the command ring.
pub const DB_VALUE_HOST: u32 = 0;

/// Doorbell value for endpoint `ep_index` and stream `stream_id` (XHCI 5.6).
pub const fn db_value(ep_index: u8, stream_id: u16) -> u32 {
    (ep_index as u32 + 1) | ((stream_id as u32) << 16)
}

/// Decodes a doorbell value into the DB Target (a Device Context Index) and DB Stream ID.
pub const fn db_decode(value: u32) -> (u8, u16) {
    ((value & 0xFF) as u8, (value >> 16) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_values() {
        assert_eq!(db_value(0, 0), 1);
        assert_eq!(db_value(2, 5), 3 | (5 << 16));
        assert_eq!(db_decode(db_value(2, 5)), (3, 5));
    }
}
