//! 도메인 상수들
//!
//! SKU 키 규칙과 레코드 정규화에 쓰이는 상수를 정의합니다.

/// SKU 키 관련 상수
pub mod sku {
    /// 사이즈 정보가 없는 상품의 관례적 사이즈 라벨
    pub const ONE_SIZE: &str = "One Size";

    /// SKU 키 구성 요소 구분자 (`{colour}_{size}`)
    pub const KEY_SEPARATOR: char = '_';
}

/// 레코드 정규화 관련 상수
pub mod record {
    /// ItemKey 의 사이트 접두사 구분자 (`{site}:{id}`)
    pub const ITEM_KEY_SEPARATOR: char = ':';

    /// Context 에서 ItemKey 를 담는 필드 이름
    pub const CONTEXT_ITEM_KEY: &str = "item_key";

    /// Context 에서 페이지 번호를 담는 필드 이름
    pub const CONTEXT_PAGE: &str = "page";
}
